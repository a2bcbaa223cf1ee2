#![doc = "Common types shared across the mbtcp workspace."]

pub mod config;
pub mod error;
pub mod identity;

pub use config::*;
pub use error::*;
pub use identity::*;
