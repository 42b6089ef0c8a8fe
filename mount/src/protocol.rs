//! Axis controller serial protocol
//!
//! Every exchange is one command frame followed by one response frame:
//!
//! ```text
//! command:  [address] [opcode] [payload ...] [checksum]
//! response: [address] [body ...]             [checksum]
//! ```
//!
//! The checksum is the low byte of the sum of all preceding bytes. A
//! response body is either a single status byte (`1` ok, `0` rejected)
//! or a little-endian value whose width depends on the opcode.

use crate::error::{AxisError, AxisResult};

/// Opcodes understood by the axis controllers
pub mod opcodes {
    /// Raw encoder reading, u16 LE
    pub const READ_ENCODER: u8 = 0x30;
    /// Pulses received since the last zero, i32 LE
    pub const READ_PULSE_COUNT: u8 = 0x33;
    /// Cumulative shaft angle, 65536 counts per motor turn, i32 LE
    pub const READ_SHAFT_ANGLE: u8 = 0x36;
    /// Driver enable pin, status byte
    pub const READ_ENABLE: u8 = 0x3A;
    /// Speed for subsequent start commands, u16 LE pulses per second
    pub const SET_SPEED: u8 = 0x85;
    /// Direction for subsequent start commands, 0 forward / 1 reverse
    pub const SET_DIRECTION: u8 = 0x86;
    /// Make the current position pulse zero
    pub const SET_ZERO: u8 = 0x91;
    /// Drive back to pulse zero
    pub const RETURN_TO_ZERO: u8 = 0x94;
    /// Driver enable, 0 off / 1 on
    pub const SET_ENABLE: u8 = 0xF3;
    /// Run continuously at the configured speed and direction
    pub const START: u8 = 0xF6;
    /// Stop immediately
    pub const STOP: u8 = 0xF7;
    /// Relative move, i32 LE pulses
    pub const MOVE_BY_PULSES: u8 = 0xFD;
    /// Absolute move, i32 LE pulse target
    pub const MOVE_TO_TARGET: u8 = 0xFE;
}

/// Address byte + checksum byte around every response body
pub const FRAME_OVERHEAD: usize = 2;

/// Direction of a constant-speed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward = 0,
    Reverse = 1,
}

impl Direction {
    /// Direction that increases the pulse count for a signed rate
    pub fn from_rate(rate: f64) -> Self {
        if rate >= 0.0 {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

/// Low byte of the sum of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Width of the response body for an opcode
pub fn response_body_len(opcode: u8) -> usize {
    match opcode {
        opcodes::READ_ENCODER => 2,
        opcodes::READ_PULSE_COUNT | opcodes::READ_SHAFT_ANGLE => 4,
        _ => 1,
    }
}

/// A command addressed to one axis controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisCommand {
    pub address: u8,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl AxisCommand {
    pub fn new(address: u8, opcode: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            opcode,
            payload: payload.into(),
        }
    }

    /// Serialize to a frame with trailing checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.payload.len() + 3);
        frame.push(self.address);
        frame.push(self.opcode);
        frame.extend_from_slice(&self.payload);
        frame.push(checksum(&frame));
        frame
    }

    /// Parse a command frame (used by the controller side of the link)
    pub fn decode(frame: &[u8]) -> AxisResult<Self> {
        if frame.len() < 3 {
            return Err(AxisError::InvalidResponse(format!(
                "command frame of {} bytes is too short",
                frame.len()
            )));
        }
        let (body, tail) = frame.split_at(frame.len() - 1);
        let expected = checksum(body);
        if tail[0] != expected {
            return Err(AxisError::ChecksumMismatch {
                expected,
                received: tail[0],
            });
        }
        Ok(Self {
            address: body[0],
            opcode: body[1],
            payload: body[2..].to_vec(),
        })
    }

    /// Total length of the response frame this command expects
    pub fn expected_response_len(&self) -> usize {
        response_body_len(self.opcode) + FRAME_OVERHEAD
    }
}

/// A decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisResponse {
    pub address: u8,
    pub body: Vec<u8>,
}

impl AxisResponse {
    pub fn new(address: u8, body: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            body: body.into(),
        }
    }

    /// Status response: `1` accepted, `0` rejected
    pub fn status(address: u8, ok: bool) -> Self {
        Self::new(address, vec![u8::from(ok)])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.body.len() + FRAME_OVERHEAD);
        frame.push(self.address);
        frame.extend_from_slice(&self.body);
        frame.push(checksum(&frame));
        frame
    }

    /// Validate and parse a response frame for `command`
    pub fn decode(command: &AxisCommand, frame: &[u8]) -> AxisResult<Self> {
        let expected_len = command.expected_response_len();
        if frame.len() != expected_len {
            return Err(AxisError::InvalidResponse(format!(
                "expected {} bytes for opcode 0x{:02X}, received {}",
                expected_len,
                command.opcode,
                frame.len()
            )));
        }
        let (body, tail) = frame.split_at(frame.len() - 1);
        let expected = checksum(body);
        if tail[0] != expected {
            return Err(AxisError::ChecksumMismatch {
                expected,
                received: tail[0],
            });
        }
        if body[0] != command.address {
            return Err(AxisError::InvalidResponse(format!(
                "response from 0x{:02X} to a command for 0x{:02X}",
                body[0], command.address
            )));
        }
        Ok(Self {
            address: body[0],
            body: body[1..].to_vec(),
        })
    }

    /// Interpret the body as a status byte
    pub fn is_ok(&self) -> bool {
        self.body.first().copied() == Some(1)
    }

    pub fn value_i32(&self) -> AxisResult<i32> {
        let bytes: [u8; 4] = self.body.as_slice().try_into().map_err(|_| {
            AxisError::InvalidResponse(format!("expected 4 value bytes, got {}", self.body.len()))
        })?;
        Ok(i32::from_le_bytes(bytes))
    }

    pub fn value_u16(&self) -> AxisResult<u16> {
        let bytes: [u8; 2] = self.body.as_slice().try_into().map_err(|_| {
            AxisError::InvalidResponse(format!("expected 2 value bytes, got {}", self.body.len()))
        })?;
        Ok(u16::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_pulse_count_frame() {
        let cmd = AxisCommand::new(0xE0, opcodes::READ_PULSE_COUNT, Vec::new());
        assert_eq!(checksum(&[0xE0, 0x33]), 0x13);
        assert_eq!(cmd.encode(), vec![0xE0, 0x33, 0x13]);
        assert_eq!(cmd.expected_response_len(), 6);
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x01]), 0x00);
        assert_eq!(checksum(&[0xE0, 0xF7]), 0xD7);
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn test_command_with_payload() {
        let cmd = AxisCommand::new(0xE1, opcodes::SET_SPEED, 1000u16.to_le_bytes());
        let frame = cmd.encode();
        assert_eq!(&frame[..4], &[0xE1, 0x85, 0xE8, 0x03]);
        assert_eq!(frame[4], checksum(&frame[..4]));
        assert_eq!(AxisCommand::decode(&frame).unwrap(), cmd);
    }

    #[test]
    fn test_decode_pulse_count_response() {
        let cmd = AxisCommand::new(0xE0, opcodes::READ_PULSE_COUNT, Vec::new());
        let mut frame = vec![0xE0];
        frame.extend_from_slice(&(-256i32).to_le_bytes());
        frame.push(checksum(&frame));

        let response = AxisResponse::decode(&cmd, &frame).unwrap();
        assert_eq!(response.value_i32().unwrap(), -256);
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let cmd = AxisCommand::new(0xE0, opcodes::STOP, Vec::new());
        let err = AxisResponse::decode(&cmd, &[0xE0, 0x01, 0x00]).unwrap_err();
        assert_eq!(
            err,
            AxisError::ChecksumMismatch {
                expected: 0xE1,
                received: 0x00
            }
        );
    }

    #[test]
    fn test_decode_rejects_wrong_address() {
        let cmd = AxisCommand::new(0xE0, opcodes::STOP, Vec::new());
        let frame = AxisResponse::status(0xE1, true).encode();
        assert!(matches!(
            AxisResponse::decode(&cmd, &frame),
            Err(AxisError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        let cmd = AxisCommand::new(0xE0, opcodes::READ_PULSE_COUNT, Vec::new());
        let frame = AxisResponse::status(0xE0, true).encode();
        assert!(matches!(
            AxisResponse::decode(&cmd, &frame),
            Err(AxisError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_status_response() {
        assert_eq!(AxisResponse::status(0xE0, true).encode(), vec![0xE0, 0x01, 0xE1]);
        assert!(AxisResponse::status(0xE0, true).is_ok());
        assert!(!AxisResponse::status(0xE0, false).is_ok());
    }

    #[test]
    fn test_direction_from_rate() {
        assert_eq!(Direction::from_rate(1.5), Direction::Forward);
        assert_eq!(Direction::from_rate(-0.2), Direction::Reverse);
        assert_eq!(Direction::Forward.reversed(), Direction::Reverse);
    }
}
