//! Protocol Data Unit codec.
//!
//! Encodes and decodes the holding-register subset of Modbus:
//! - Read Holding Registers (Function 0x03)
//! - Write Single Register (Function 0x06)
//! - Write Multiple Registers (Function 0x10)
//!
//! plus exception responses for any function code. The codec does no I/O
//! and holds no state.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mbtcp_common::error::{ExceptionCode, ModbusError, ModbusResult};

/// Largest PDU (function code + payload) that fits an MBAP frame.
pub const MAX_PDU_SIZE: usize = 253;

/// Most registers a single read may request.
pub const MAX_READ_QUANTITY: u16 = 125;

/// Most registers a single multiple-write may carry.
pub const MAX_WRITE_QUANTITY: u16 = 123;

/// High bit marking an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus function codes served by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Holding Registers (0x03).
    ReadHoldingRegisters = 0x03,
    /// Write Single Register (0x06).
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10).
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Parse a function code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x03 => Some(Self::ReadHoldingRegisters),
            0x06 => Some(Self::WriteSingleRegister),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Wire representation.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A function code plus its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    function: u8,
    payload: Bytes,
}

impl Pdu {
    /// Build a PDU from a function code and payload.
    pub fn new(function: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            function,
            payload: payload.into(),
        }
    }

    /// Build an exception PDU answering `request_function`.
    pub fn exception(request_function: u8, code: ExceptionCode) -> Self {
        Self::new(
            request_function | EXCEPTION_FLAG,
            Bytes::copy_from_slice(&[code.as_byte()]),
        )
    }

    /// Split raw PDU bytes into function code and payload without copying.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::MalformedPdu`] if `bytes` is empty.
    pub fn from_bytes(bytes: Bytes) -> ModbusResult<Self> {
        if bytes.is_empty() {
            return Err(ModbusError::MalformedPdu("empty PDU".into()));
        }
        Ok(Self {
            function: bytes[0],
            payload: bytes.slice(1..),
        })
    }

    /// Same as [`Pdu::from_bytes`] for a borrowed slice.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::MalformedPdu`] if `bytes` is empty.
    pub fn from_slice(bytes: &[u8]) -> ModbusResult<Self> {
        Self::from_bytes(Bytes::copy_from_slice(bytes))
    }

    /// Raw function code byte, exception flag included.
    #[inline]
    pub fn function(&self) -> u8 {
        self.function
    }

    /// Payload following the function code.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the function code carries the exception flag.
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    /// Encoded size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        1 + self.payload.len()
    }

    /// A PDU always holds at least its function code.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Serialize to `function code || payload`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.push(self.function);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read `count` holding registers starting at `address`.
    ReadHoldingRegisters {
        /// First register.
        address: u16,
        /// Number of registers.
        count: u16,
    },
    /// Write one holding register.
    WriteSingleRegister {
        /// Register address.
        address: u16,
        /// New value.
        value: u16,
    },
    /// Write consecutive holding registers starting at `address`.
    WriteMultipleRegisters {
        /// First register.
        address: u16,
        /// New values in address order.
        values: Vec<u16>,
    },
}

impl Request {
    /// Function code this request is sent with.
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Reject quantities the protocol cannot carry.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::InvalidRequest`] for an out-of-range quantity.
    pub fn validate(&self) -> ModbusResult<()> {
        match self {
            Self::ReadHoldingRegisters { count, .. } => {
                if *count == 0 || *count > MAX_READ_QUANTITY {
                    return Err(ModbusError::InvalidRequest(format!(
                        "read quantity must be within 1..={MAX_READ_QUANTITY}, got {count}"
                    )));
                }
            }
            Self::WriteSingleRegister { .. } => {}
            Self::WriteMultipleRegisters { values, .. } => {
                if values.is_empty() || values.len() > usize::from(MAX_WRITE_QUANTITY) {
                    return Err(ModbusError::InvalidRequest(format!(
                        "write quantity must be within 1..={MAX_WRITE_QUANTITY}, got {}",
                        values.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encode into a PDU.
    ///
    /// The request must already satisfy [`Request::validate`]; quantities
    /// outside the protocol limits cannot be represented on the wire.
    pub fn encode(&self) -> Pdu {
        let mut payload = BytesMut::with_capacity(MAX_PDU_SIZE - 1);
        match self {
            Self::ReadHoldingRegisters { address, count } => {
                payload.put_u16(*address);
                payload.put_u16(*count);
            }
            Self::WriteSingleRegister { address, value } => {
                payload.put_u16(*address);
                payload.put_u16(*value);
            }
            Self::WriteMultipleRegisters { address, values } => {
                debug_assert!(
                    values.len() <= usize::from(MAX_WRITE_QUANTITY),
                    "write quantity {} exceeds {MAX_WRITE_QUANTITY}",
                    values.len()
                );
                payload.put_u16(*address);
                payload.put_u16(values.len() as u16);
                payload.put_u8((values.len() * 2) as u8);
                for &value in values {
                    payload.put_u16(value);
                }
            }
        }
        Pdu::new(self.function_code().as_byte(), payload.freeze())
    }

    /// Decode a request PDU received by a server.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::IllegalFunction`] for a function code outside the served set.
    /// - [`ModbusError::MalformedPdu`] when the payload does not have the fixed
    ///   layout of its function code.
    /// - [`ModbusError::IllegalDataValue`] when a quantity is out of range or the
    ///   declared byte count disagrees with the quantity or the data present.
    pub fn decode(pdu: &Pdu) -> ModbusResult<Self> {
        let Some(function) = FunctionCode::from_byte(pdu.function()) else {
            return Err(ModbusError::IllegalFunction(pdu.function()));
        };
        let mut payload = pdu.payload();

        match function {
            FunctionCode::ReadHoldingRegisters => {
                expect_len(function, payload, 4)?;
                let address = payload.get_u16();
                let count = payload.get_u16();
                if count == 0 || count > MAX_READ_QUANTITY {
                    return Err(ModbusError::IllegalDataValue(format!(
                        "read quantity {count} outside 1..={MAX_READ_QUANTITY}"
                    )));
                }
                Ok(Self::ReadHoldingRegisters { address, count })
            }
            FunctionCode::WriteSingleRegister => {
                expect_len(function, payload, 4)?;
                let address = payload.get_u16();
                let value = payload.get_u16();
                Ok(Self::WriteSingleRegister { address, value })
            }
            FunctionCode::WriteMultipleRegisters => {
                if payload.len() < 5 {
                    return Err(ModbusError::MalformedPdu(format!(
                        "write multiple registers needs at least 5 payload bytes, got {}",
                        payload.len()
                    )));
                }
                let address = payload.get_u16();
                let count = payload.get_u16();
                let byte_count = usize::from(payload.get_u8());

                if count == 0 || count > MAX_WRITE_QUANTITY {
                    return Err(ModbusError::IllegalDataValue(format!(
                        "write quantity {count} outside 1..={MAX_WRITE_QUANTITY}"
                    )));
                }
                if byte_count != usize::from(count) * 2 {
                    return Err(ModbusError::IllegalDataValue(format!(
                        "byte count {byte_count} does not match {count} registers"
                    )));
                }
                if payload.len() != byte_count {
                    return Err(ModbusError::IllegalDataValue(format!(
                        "byte count {byte_count} but {} data bytes present",
                        payload.len()
                    )));
                }

                let values = (0..count).map(|_| payload.get_u16()).collect();
                Ok(Self::WriteMultipleRegisters { address, values })
            }
        }
    }
}

/// A decoded server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Register values in address order.
    ReadHoldingRegisters(Vec<u16>),
    /// Echo of a single register write.
    WriteSingleRegister {
        /// Register address.
        address: u16,
        /// Value written.
        value: u16,
    },
    /// Acknowledgement of a multiple register write.
    WriteMultipleRegisters {
        /// First register written.
        address: u16,
        /// Number of registers written.
        count: u16,
    },
    /// Exception answering the given request function.
    Exception {
        /// Function code of the request (without the exception flag).
        function: u8,
        /// Reason reported by the server.
        code: ExceptionCode,
    },
}

impl Response {
    /// Exception response for a request function code.
    pub fn exception(request_function: u8, code: ExceptionCode) -> Self {
        Self::Exception {
            function: request_function & !EXCEPTION_FLAG,
            code,
        }
    }

    /// Function code of the request this response answers.
    pub fn function(&self) -> u8 {
        match self {
            Self::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters.as_byte(),
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister.as_byte(),
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters.as_byte(),
            Self::Exception { function, .. } => *function,
        }
    }

    /// Encode into a PDU.
    ///
    /// A register read answer carries at most 125 values.
    pub fn encode(&self) -> Pdu {
        let mut payload = BytesMut::with_capacity(MAX_PDU_SIZE - 1);
        match self {
            Self::ReadHoldingRegisters(values) => {
                debug_assert!(
                    values.len() <= usize::from(MAX_READ_QUANTITY),
                    "read quantity {} exceeds {MAX_READ_QUANTITY}",
                    values.len()
                );
                payload.put_u8((values.len() * 2) as u8);
                for &value in values {
                    payload.put_u16(value);
                }
            }
            Self::WriteSingleRegister { address, value } => {
                payload.put_u16(*address);
                payload.put_u16(*value);
            }
            Self::WriteMultipleRegisters { address, count } => {
                payload.put_u16(*address);
                payload.put_u16(*count);
            }
            Self::Exception { function, code } => {
                return Pdu::exception(*function, *code);
            }
        }
        Pdu::new(self.function(), payload.freeze())
    }

    /// Decode a response PDU received by a client.
    ///
    /// # Errors
    ///
    /// - [`ModbusError::MalformedPdu`] when a length or count field disagrees
    ///   with the payload, or an exception code is unknown.
    /// - [`ModbusError::UnexpectedResponse`] for a function code outside the
    ///   served set.
    pub fn decode(pdu: &Pdu) -> ModbusResult<Self> {
        let mut payload = pdu.payload();

        if pdu.is_exception() {
            if payload.len() != 1 {
                return Err(ModbusError::MalformedPdu(format!(
                    "exception response needs 1 payload byte, got {}",
                    payload.len()
                )));
            }
            let raw = payload[0];
            let code = ExceptionCode::from_byte(raw).ok_or_else(|| {
                ModbusError::MalformedPdu(format!("unknown exception code 0x{raw:02X}"))
            })?;
            return Ok(Self::exception(pdu.function(), code));
        }

        let Some(function) = FunctionCode::from_byte(pdu.function()) else {
            return Err(ModbusError::UnexpectedResponse(format!(
                "unsupported function code 0x{:02X}",
                pdu.function()
            )));
        };

        match function {
            FunctionCode::ReadHoldingRegisters => {
                if payload.is_empty() {
                    return Err(ModbusError::MalformedPdu(
                        "read response missing byte count".into(),
                    ));
                }
                let byte_count = usize::from(payload.get_u8());
                if byte_count % 2 != 0 {
                    return Err(ModbusError::MalformedPdu(format!(
                        "odd byte count {byte_count} in register response"
                    )));
                }
                if payload.len() != byte_count {
                    return Err(ModbusError::MalformedPdu(format!(
                        "byte count {byte_count} but {} data bytes present",
                        payload.len()
                    )));
                }
                let values = (0..byte_count / 2).map(|_| payload.get_u16()).collect();
                Ok(Self::ReadHoldingRegisters(values))
            }
            FunctionCode::WriteSingleRegister => {
                expect_len(function, payload, 4)?;
                let address = payload.get_u16();
                let value = payload.get_u16();
                Ok(Self::WriteSingleRegister { address, value })
            }
            FunctionCode::WriteMultipleRegisters => {
                expect_len(function, payload, 4)?;
                let address = payload.get_u16();
                let count = payload.get_u16();
                Ok(Self::WriteMultipleRegisters { address, count })
            }
        }
    }
}

fn expect_len(function: FunctionCode, payload: &[u8], expected: usize) -> ModbusResult<()> {
    if payload.len() != expected {
        return Err(ModbusError::MalformedPdu(format!(
            "function 0x{:02X} needs {expected} payload bytes, got {}",
            function.as_byte(),
            payload.len()
        )));
    }
    Ok(())
}
