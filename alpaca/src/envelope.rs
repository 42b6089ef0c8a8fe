//! Alpaca response envelope

use crate::params::Params;
use serde::Serialize;
use serde_json::Value;
use starget_mount::MountError;
use std::sync::atomic::{AtomicU32, Ordering};

/// Server transaction ids are unique for the lifetime of the process
static SERVER_TRANSACTION_ID: AtomicU32 = AtomicU32::new(0);

pub fn next_server_transaction() -> u32 {
    SERVER_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst) + 1
}

/// Result of a device call: a value for properties, nothing for methods
pub type DeviceReply = Result<Option<Value>, MountError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlpacaResponse {
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "ClientTransactionID")]
    pub client_transaction_id: u32,
    #[serde(rename = "ServerTransactionID")]
    pub server_transaction_id: u32,
    #[serde(rename = "ErrorNumber")]
    pub error_number: i32,
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
}

impl AlpacaResponse {
    pub fn ok(value: Option<Value>, params: &Params) -> Self {
        Self {
            value,
            client_transaction_id: params.client_transaction_id(),
            server_transaction_id: next_server_transaction(),
            error_number: 0,
            error_message: String::new(),
        }
    }

    /// Wrap a device error. Driver faults are only described in detail
    /// when `verbose` is set; the log always has the full text.
    pub fn error(err: &MountError, params: &Params, verbose: bool) -> Self {
        let error_message = if verbose || err.is_validation() {
            err.to_string()
        } else {
            "Internal driver error, see the server log".to_string()
        };
        Self {
            value: None,
            client_transaction_id: params.client_transaction_id(),
            server_transaction_id: next_server_transaction(),
            error_number: err.error_number(),
            error_message,
        }
    }

    pub fn from_reply(reply: &DeviceReply, params: &Params, verbose: bool) -> Self {
        match reply {
            Ok(value) => Self::ok(value.clone(), params),
            Err(e) => Self::error(e, params, verbose),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use starget_mount::AxisError;

    fn params() -> Params {
        Params::from_pairs([("ClientTransactionID", "42")])
    }

    #[test]
    fn test_value_envelope() {
        let response = AlpacaResponse::ok(Some(json!(12.5)), &params());
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["Value"], json!(12.5));
        assert_eq!(body["ClientTransactionID"], json!(42));
        assert_eq!(body["ErrorNumber"], json!(0));
        assert_eq!(body["ErrorMessage"], json!(""));
        assert!(body["ServerTransactionID"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_method_envelope_has_no_value() {
        let body = serde_json::to_value(AlpacaResponse::ok(None, &params())).unwrap();
        assert!(body.get("Value").is_none());
    }

    #[test]
    fn test_error_envelope() {
        let err = MountError::invalid_value("Declination 91");
        let body = serde_json::to_value(AlpacaResponse::error(&err, &params(), false)).unwrap();
        assert_eq!(body["ErrorNumber"], json!(0x401));
        assert!(body["ErrorMessage"].as_str().unwrap().contains("Declination 91"));
    }

    #[test]
    fn test_driver_fault_detail_depends_on_verbosity() {
        let err: MountError = AxisError::PortError("/dev/ttyUSB0 vanished".to_string()).into();
        let quiet = AlpacaResponse::error(&err, &params(), false);
        assert_eq!(quiet.error_number, 0x500);
        assert!(!quiet.error_message.contains("ttyUSB0"));
        let verbose = AlpacaResponse::error(&err, &params(), true);
        assert!(verbose.error_message.contains("ttyUSB0"));
    }

    #[test]
    fn test_server_transaction_ids_increase() {
        let a = next_server_transaction();
        let b = next_server_transaction();
        assert!(b > a);
    }
}
