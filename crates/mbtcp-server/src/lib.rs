//! Modbus TCP device.
//!
//! This crate provides:
//! - [`datastore`] module with register banks and the shared [`UnitContext`]
//! - [`session`] module that answers requests arriving on one connection
//! - [`server`] module with the listening [`ModbusTcpServer`]
//!
//! # Example
//!
//! ```no_run
//! use mbtcp_common::config::ServerConfig;
//! use mbtcp_server::ModbusTcpServer;
//!
//! let server = ModbusTcpServer::bind(&ServerConfig::default())?;
//! server.write_register(0, 42)?;
//! println!("listening on {}", server.local_addr());
//! # Ok::<(), mbtcp_common::error::ModbusError>(())
//! ```

pub mod datastore;
pub mod server;
pub mod session;

pub use datastore::{RegisterBank, RegisterKind, UnitContext};
pub use server::ModbusTcpServer;
pub use session::{process_request, Session, SessionEnd};
