//! Request-level errors
//!
//! These are problems with the HTTP request itself and are answered with
//! a 400 and a plain-text message. Errors raised by the telescope travel
//! inside the Alpaca envelope instead (see [`crate::envelope`]).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlpacaError {
    #[error("Device number {0} is not configured")]
    InvalidDeviceNumber(String),

    #[error("Unknown operation: {method} {operation}")]
    UnknownOperation { method: String, operation: String },

    #[error("Missing parameter {0}")]
    MissingParameter(String),

    #[error("Parameter {name} has an invalid value '{value}'")]
    InvalidParameter { name: String, value: String },
}

impl AlpacaError {
    pub fn unknown_operation(method: impl Into<String>, operation: impl Into<String>) -> Self {
        AlpacaError::UnknownOperation {
            method: method.into(),
            operation: operation.into(),
        }
    }

    pub fn invalid_parameter(name: impl Into<String>, value: impl Into<String>) -> Self {
        AlpacaError::InvalidParameter {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl IntoResponse for AlpacaError {
    fn into_response(self) -> Response {
        debug!("Bad request: {}", self);
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AlpacaError::unknown_operation("PUT", "frobnicate");
        assert_eq!(err.to_string(), "Unknown operation: PUT frobnicate");

        let err = AlpacaError::invalid_parameter("RightAscension", "abc");
        let msg = err.to_string();
        assert!(msg.contains("RightAscension"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn test_bad_request_status() {
        let response = AlpacaError::MissingParameter("Axis".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
