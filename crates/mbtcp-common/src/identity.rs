//! Device identification metadata.
//!
//! Static strings handed to the server at construction. The protocol
//! engine never inspects them; they are logged at startup and exposed
//! to the embedding application.

use serde::{Deserialize, Serialize};

/// Vendor and product strings describing the simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    /// Vendor name.
    pub vendor_name: String,
    /// Product code.
    pub product_code: String,
    /// Vendor URL.
    pub vendor_url: String,
    /// Product name.
    pub product_name: String,
    /// Model name.
    pub model_name: String,
    /// Major/minor revision string.
    pub major_minor_revision: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            vendor_name: "MockPLCs".into(),
            product_code: "MP".into(),
            vendor_url: "http://github.com/bashwork/pymodbus/".into(),
            product_name: "MockPLC 3000".into(),
            model_name: "MockPLC Ultimate".into(),
            major_minor_revision: "1.0".into(),
        }
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({}) rev {}",
            self.vendor_name, self.product_name, self.model_name, self.major_minor_revision
        )
    }
}
