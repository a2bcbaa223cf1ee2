//! Configuration structures for the Modbus server and client.
//!
//! Supports TOML deserialization with sensible defaults for
//! development and explicit values for production deployment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::identity::DeviceIdentity;

/// Default Modbus TCP service port (non-privileged alternative to 502).
pub const DEFAULT_PORT: u16 = 5020;

/// Default number of registers in each bank.
pub const DEFAULT_BANK_SIZE: usize = 1024;

/// Largest bank addressable with 16-bit register addresses.
pub const MAX_BANK_SIZE: usize = 0x1_0000;

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MbtcpConfig {
    /// Server (device) side settings.
    pub server: ServerConfig,
    /// Client (controller) side settings.
    pub client: ClientConfig,
}

/// How the four register types map onto storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegisterLayout {
    /// One bank per register type.
    #[default]
    Independent,
    /// A single bank viewed through all four type selectors.
    Aliased,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub bind_address: String,

    /// Registers per bank.
    pub bank_size: usize,

    /// Storage layout for the register types.
    pub layout: RegisterLayout,

    /// How often idle sessions check for shutdown.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Identification metadata reported by the device.
    pub identity: DeviceIdentity,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("127.0.0.1:{DEFAULT_PORT}"),
            bank_size: DEFAULT_BANK_SIZE,
            layout: RegisterLayout::Independent,
            poll_interval: Duration::from_millis(100),
            identity: DeviceIdentity::default(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (host:port).
    pub server_address: String,

    /// Unit identifier placed in every request.
    pub unit_id: u8,

    /// Connection establishment timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Deadline for a correlated response.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: format!("127.0.0.1:{DEFAULT_PORT}"),
            unit_id: 1,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(1),
        }
    }
}

impl MbtcpConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check values that serde cannot constrain.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bank_size == 0 || self.server.bank_size > MAX_BANK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "server.bank_size must be within 1..={MAX_BANK_SIZE}, got {}",
                self.server.bank_size
            )));
        }
        if self.server.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "server.poll_interval must be non-zero".into(),
            ));
        }
        if self.client.response_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "client.response_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
