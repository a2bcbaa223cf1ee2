//! Error taxonomy shared by the codec, the client engine, and the server.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Modbus exception codes carried in exception responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Illegal function code.
    IllegalFunction = 0x01,
    /// Illegal data address.
    IllegalDataAddress = 0x02,
    /// Illegal data value.
    IllegalDataValue = 0x03,
    /// Server device failure.
    ServerDeviceFailure = 0x04,
    /// Acknowledge (request accepted, processing).
    Acknowledge = 0x05,
    /// Server device busy.
    ServerDeviceBusy = 0x06,
    /// Gateway path unavailable.
    GatewayPathUnavailable = 0x0A,
    /// Gateway target device failed to respond.
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Parse an exception code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }

    /// Wire representation.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "Illegal Function"),
            Self::IllegalDataAddress => write!(f, "Illegal Data Address"),
            Self::IllegalDataValue => write!(f, "Illegal Data Value"),
            Self::ServerDeviceFailure => write!(f, "Server Device Failure"),
            Self::Acknowledge => write!(f, "Acknowledge"),
            Self::ServerDeviceBusy => write!(f, "Server Device Busy"),
            Self::GatewayPathUnavailable => write!(f, "Gateway Path Unavailable"),
            Self::GatewayTargetFailed => write!(f, "Gateway Target Failed"),
        }
    }
}

/// Modbus error types covering store faults, protocol faults, and transport failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// The function code is not served by this device.
    #[error("illegal function: 0x{0:02X}")]
    IllegalFunction(u8),

    /// Requested range falls outside the register bank.
    #[error("illegal data address: {count} register(s) at {address} exceed bank of {len}")]
    IllegalDataAddress {
        /// First register of the request.
        address: usize,
        /// Number of registers requested.
        count: usize,
        /// Length of the addressed bank.
        len: usize,
    },

    /// Declared byte count or quantity disagrees with the request body.
    #[error("illegal data value: {0}")]
    IllegalDataValue(String),

    /// Internal store fault unrelated to the request shape.
    #[error("device failure: {0}")]
    DeviceFailure(String),

    /// Malformed MBAP header or frame.
    #[error("frame error: {0}")]
    FrameError(String),

    /// PDU length disagrees with what the function code requires.
    #[error("malformed PDU: {0}")]
    MalformedPdu(String),

    /// No correlated response arrived before the deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Transport closed while an operation was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server's echo does not match the write request.
    #[error("write mismatch on {field}: expected {expected}, got {actual}")]
    WriteMismatch {
        /// Echoed field that disagrees (`address`, `value` or `count`).
        field: &'static str,
        /// Value sent in the request.
        expected: u16,
        /// Value echoed by the server.
        actual: u16,
    },

    /// The server answered with an exception response.
    #[error("modbus exception for function 0x{function:02X}: {code}")]
    Exception {
        /// Function code of the original request.
        function: u8,
        /// Exception code returned by the server.
        code: ExceptionCode,
    },

    /// Correlated response has the wrong unit id or function code.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Request rejected locally before anything was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Other transport error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Listening socket could not be bound.
    #[error("failed to bind {addr}: {reason}")]
    Bind {
        /// Requested bind address.
        addr: String,
        /// Underlying failure.
        reason: String,
    },
}

impl ModbusError {
    /// Exception code this error is reported with on the wire.
    ///
    /// Returns `None` for faults that are not answered with an exception
    /// response (framing, transport, and client-side failures).
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            Self::IllegalFunction(_) => Some(ExceptionCode::IllegalFunction),
            Self::IllegalDataAddress { .. } => Some(ExceptionCode::IllegalDataAddress),
            Self::IllegalDataValue(_) => Some(ExceptionCode::IllegalDataValue),
            Self::DeviceFailure(_) => Some(ExceptionCode::ServerDeviceFailure),
            Self::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error means the underlying connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

impl From<io::Error> for ModbusError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Self::ConnectionClosed,
            _ => Self::Io(e.to_string()),
        }
    }
}

/// Convenience type alias for Modbus operations.
pub type ModbusResult<T> = Result<T, ModbusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_code_parsing() {
        assert_eq!(
            ExceptionCode::from_byte(0x02),
            Some(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            ExceptionCode::from_byte(0x04),
            Some(ExceptionCode::ServerDeviceFailure)
        );
        assert_eq!(ExceptionCode::from_byte(0xFF), None);
        assert_eq!(ExceptionCode::IllegalDataValue.as_byte(), 0x03);
    }

    #[test]
    fn test_store_faults_map_to_wire_codes() {
        let err = ModbusError::IllegalDataAddress {
            address: 1022,
            count: 5,
            len: 1024,
        };
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));
        assert_eq!(
            ModbusError::IllegalDataValue("byte count".into()).exception_code(),
            Some(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            ModbusError::DeviceFailure("poisoned".into()).exception_code(),
            Some(ExceptionCode::ServerDeviceFailure)
        );
        assert_eq!(
            ModbusError::IllegalFunction(0x2B).exception_code(),
            Some(ExceptionCode::IllegalFunction)
        );
    }

    #[test]
    fn test_protocol_faults_have_no_wire_code() {
        assert_eq!(ModbusError::FrameError("bad".into()).exception_code(), None);
        assert_eq!(ModbusError::MalformedPdu("short".into()).exception_code(), None);
        assert_eq!(ModbusError::ConnectionClosed.exception_code(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let closed: ModbusError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(closed.is_connection_closed());

        let reset: ModbusError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(reset.is_connection_closed());

        let other: ModbusError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(other, ModbusError::Io(_)));
    }

    #[test]
    fn test_exception_display() {
        let err = ModbusError::Exception {
            function: 0x03,
            code: ExceptionCode::IllegalDataAddress,
        };
        assert_eq!(
            err.to_string(),
            "modbus exception for function 0x03: Illegal Data Address"
        );
    }
}
