//! Modbus TCP wire protocol.
//!
//! This crate provides:
//! - [`pdu`] module with the holding-register PDU codec and exception responses
//! - [`mbap`] module with MBAP header wrapping and the resumable [`FrameDecoder`]
//!
//! Nothing here performs I/O; the client and server crates drive these
//! types over a socket.

pub mod mbap;
pub mod pdu;

pub use mbap::*;
pub use pdu::*;

pub use mbtcp_common::error::{ExceptionCode, ModbusError, ModbusResult};
