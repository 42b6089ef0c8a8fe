//! Request parameters
//!
//! Alpaca parameter names are case-insensitive; values arrive as strings
//! from the query (GET) or the form body (PUT).

use crate::error::AlpacaError;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, String>,
}

impl Params {
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn required(&self, name: &str) -> Result<&str, AlpacaError> {
        self.get(name)
            .ok_or_else(|| AlpacaError::MissingParameter(name.to_string()))
    }

    /// Parse a required parameter
    pub fn parse<T: FromStr>(&self, name: &str) -> Result<T, AlpacaError> {
        let raw = self.required(name)?;
        raw.trim()
            .parse()
            .map_err(|_| AlpacaError::invalid_parameter(name, raw))
    }

    /// Alpaca booleans are `true`/`false` in any case
    pub fn boolean(&self, name: &str) -> Result<bool, AlpacaError> {
        let raw = self.required(name)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(AlpacaError::invalid_parameter(name, raw)),
        }
    }

    /// Echoed back in the envelope; absent or malformed ids become 0
    pub fn client_transaction_id(&self) -> u32 {
        self.get("ClientTransactionID")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn client_id(&self) -> u32 {
        self.get("ClientID")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

impl From<HashMap<String, String>> for Params {
    fn from(values: HashMap<String, String>) -> Self {
        Self::from_pairs(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_case_insensitive() {
        let params = Params::from_pairs([("rightascension", "10.5"), ("DECLINATION", "-20")]);
        assert_eq!(params.parse::<f64>("RightAscension").unwrap(), 10.5);
        assert_eq!(params.parse::<f64>("Declination").unwrap(), -20.0);
    }

    #[test]
    fn test_missing_and_invalid() {
        let params = Params::from_pairs([("Axis", "x")]);
        assert_eq!(
            params.parse::<i32>("Rate").unwrap_err(),
            AlpacaError::MissingParameter("Rate".to_string())
        );
        assert!(matches!(
            params.parse::<i32>("Axis").unwrap_err(),
            AlpacaError::InvalidParameter { .. }
        ));
    }

    #[test]
    fn test_booleans() {
        let params = Params::from_pairs([("Tracking", "True"), ("Connected", "false"), ("X", "1")]);
        assert!(params.boolean("tracking").unwrap());
        assert!(!params.boolean("connected").unwrap());
        assert!(params.boolean("x").is_err());
    }

    #[test]
    fn test_transaction_ids() {
        let params = Params::from_pairs([("ClientID", "7"), ("clienttransactionid", "99")]);
        assert_eq!(params.client_id(), 7);
        assert_eq!(params.client_transaction_id(), 99);
        assert_eq!(Params::default().client_transaction_id(), 0);
        let bad = Params::from_pairs([("ClientTransactionID", "-3")]);
        assert_eq!(bad.client_transaction_id(), 0);
    }
}
