//! Mount error types
//!
//! Two layers: [`AxisError`] for the serial command channel of a single
//! axis controller, and [`MountError`] for everything the device facade
//! reports to its callers.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by an axis command exchange
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AxisError {
    /// No complete response within the per-command timeout
    #[error("Axis 0x{address:02X} did not answer opcode 0x{opcode:02X} within {duration:?}")]
    Timeout {
        address: u8,
        opcode: u8,
        duration: Duration,
    },

    /// Response checksum did not match the bytes received
    #[error("Checksum mismatch: expected 0x{expected:02X}, received 0x{received:02X}")]
    ChecksumMismatch { expected: u8, received: u8 },

    /// Response was too short, too long or echoed the wrong address
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Controller answered with a failure status byte
    #[error("Axis 0x{address:02X} rejected opcode 0x{opcode:02X}")]
    CommandRejected { address: u8, opcode: u8 },

    /// The home switch never closed within the homing bound
    #[error("Axis 0x{address:02X} did not find home within {duration:?}")]
    HomingTimeout { address: u8, duration: Duration },

    /// Motion did not settle on its target within the bound
    #[error("Axis 0x{address:02X} did not reach pulse {target} within {duration:?} (at {position})")]
    MoveTimeout {
        address: u8,
        target: i32,
        position: i32,
        duration: Duration,
    },

    /// Serial port open/read/write failure
    #[error("Port error: {0}")]
    PortError(String),
}

impl From<std::io::Error> for AxisError {
    fn from(err: std::io::Error) -> Self {
        AxisError::PortError(err.to_string())
    }
}

impl From<serialport::Error> for AxisError {
    fn from(err: serialport::Error) -> Self {
        AxisError::PortError(err.to_string())
    }
}

/// Result type for axis operations
pub type AxisResult<T> = Result<T, AxisError>;

/// Errors reported by the telescope device
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MountError {
    #[error("Not connected")]
    NotConnected,

    #[error("{0} is not implemented by this mount")]
    NotImplemented(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("{0} has not been set")]
    ValueNotSet(String),

    #[error("{0} is not allowed while the mount is parked")]
    InvalidWhileParked(String),

    #[error("Axis fault: {0}")]
    Axis(#[from] AxisError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MountError {
    pub fn not_implemented(what: impl Into<String>) -> Self {
        MountError::NotImplemented(what.into())
    }

    pub fn invalid_operation(what: impl Into<String>) -> Self {
        MountError::InvalidOperation(what.into())
    }

    pub fn invalid_value(what: impl Into<String>) -> Self {
        MountError::InvalidValue(what.into())
    }

    /// ASCOM Alpaca error number for the error envelope
    pub fn error_number(&self) -> i32 {
        match self {
            MountError::NotImplemented(_) => 0x400,
            MountError::InvalidValue(_) => 0x401,
            MountError::ValueNotSet(_) => 0x402,
            MountError::NotConnected => 0x407,
            MountError::InvalidWhileParked(_) => 0x408,
            MountError::InvalidOperation(_) => 0x40B,
            MountError::Axis(_) | MountError::Timeout(_) => 0x500,
            MountError::Config(_) => 0x501,
        }
    }

    /// Check whether the error was raised by validation rather than hardware
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MountError::NotConnected
                | MountError::NotImplemented(_)
                | MountError::InvalidOperation(_)
                | MountError::InvalidValue(_)
                | MountError::ValueNotSet(_)
                | MountError::InvalidWhileParked(_)
        )
    }
}

/// Result type for mount operations
pub type MountResult<T> = Result<T, MountError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_error_display() {
        let err = AxisError::Timeout {
            address: 0xE0,
            opcode: 0x33,
            duration: Duration::from_millis(100),
        };
        let msg = err.to_string();
        assert!(msg.contains("0xE0"));
        assert!(msg.contains("0x33"));
        assert!(msg.contains("100ms"));

        let err = AxisError::ChecksumMismatch {
            expected: 0x13,
            received: 0x14,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch: expected 0x13, received 0x14"
        );
    }

    #[test]
    fn test_homing_timeout_display() {
        let err = AxisError::HomingTimeout {
            address: 0xE1,
            duration: Duration::from_secs(120),
        };
        let msg = err.to_string();
        assert!(msg.contains("0xE1"));
        assert!(msg.contains("120"));
    }

    #[test]
    fn test_error_numbers() {
        assert_eq!(MountError::NotConnected.error_number(), 0x407);
        assert_eq!(MountError::not_implemented("SlewToAltAz").error_number(), 0x400);
        assert_eq!(MountError::invalid_value("RA 25").error_number(), 0x401);
        assert_eq!(MountError::invalid_operation("moving").error_number(), 0x40B);
        assert_eq!(
            MountError::InvalidWhileParked("Slew".to_string()).error_number(),
            0x408
        );
        let axis: MountError = AxisError::PortError("gone".to_string()).into();
        assert_eq!(axis.error_number(), 0x500);
        assert!(!axis.is_validation());
        assert!(MountError::NotConnected.is_validation());
    }

    #[test]
    fn test_io_error_becomes_port_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: AxisError = io.into();
        assert!(matches!(err, AxisError::PortError(ref m) if m.contains("pipe closed")));
    }
}
