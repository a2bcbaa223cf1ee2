//! Modbus TCP client.
//!
//! [`ModbusTcpClient`] keeps one persistent connection and runs one
//! transaction at a time on the caller's thread:
//!
//! ```no_run
//! use mbtcp_client::ModbusTcpClient;
//! use mbtcp_common::config::ClientConfig;
//!
//! let mut client = ModbusTcpClient::connect(&ClientConfig::default())?;
//! client.write_registers(0, &[10, 20, 30])?;
//! assert_eq!(client.read_registers(0, 3)?, vec![10, 20, 30]);
//! # Ok::<(), mbtcp_common::error::ModbusError>(())
//! ```

pub mod client;
pub mod transport;

pub use client::ModbusTcpClient;
pub use transport::{CloseHandle, Transport};
