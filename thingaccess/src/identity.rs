//! Device identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Credential triple identifying a device to the gateway.
///
/// Equality and hashing only consider `product_key` and `device_name`; the
/// secret authenticates the identity but is not part of it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub product_key: String,
    pub device_name: String,
    #[serde(default)]
    pub device_secret: String,
}

impl DeviceIdentity {
    /// Creates a new identity.
    pub fn new(
        product_key: impl Into<String>,
        device_name: impl Into<String>,
        device_secret: impl Into<String>,
    ) -> Self {
        Self {
            product_key: product_key.into(),
            device_name: device_name.into(),
            device_secret: device_secret.into(),
        }
    }

    /// Returns `productKey/deviceName`.
    pub fn thing_id(&self) -> String {
        format!("{}/{}", self.product_key, self.device_name)
    }

    /// Checks that the identifying fields are present.
    pub fn validate(&self) -> Result<(), String> {
        if self.product_key.trim().is_empty() {
            return Err("productKey is empty".to_string());
        }
        if self.device_name.trim().is_empty() {
            return Err("deviceName is empty".to_string());
        }
        Ok(())
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.product_key == other.product_key && self.device_name == other.device_name
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.product_key.hash(state);
        self.device_name.hash(state);
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("product_key", &self.product_key)
            .field("device_name", &self.device_name)
            .field("device_secret", &"***")
            .finish()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.product_key, self.device_name)
    }
}
