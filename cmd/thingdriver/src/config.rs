//! Driver configuration: the devices bound to this driver.

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use std::path::Path;
use thingaccess::DeviceIdentity;

/// Environment variable holding the JSON driver configuration.
pub const CONFIG_ENV: &str = "FC_DRIVER_CONFIG";

/// Devices to run, in configuration order.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub devices: Vec<DeviceIdentity>,
}

impl DriverConfig {
    /// Loads from `path` if given, otherwise from `FC_DRIVER_CONFIG`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(Path::new(path)),
            None => {
                let raw = std::env::var(CONFIG_ENV)
                    .with_context(|| format!("{} is not set and no --config given", CONFIG_ENV))?;
                Self::from_json(&raw)
            }
        }
    }

    /// Reads a JSON or YAML file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            Self::from_yaml(&raw)
        } else {
            Self::from_json(&raw)
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).context("the driver config is not in JSON format")?;
        Self::from_value(value)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let value: Value =
            serde_yaml::from_str(raw).context("the driver config is not valid YAML")?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self> {
        let list = value
            .get("deviceList")
            .ok_or_else(|| anyhow!("no device is bound with the driver: deviceList missing"))?;
        let entries = list
            .as_array()
            .ok_or_else(|| anyhow!("deviceList must be an array"))?;
        if entries.is_empty() {
            bail!("no device is bound with the driver");
        }

        let devices = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| -> Result<DeviceIdentity> {
                let identity: DeviceIdentity = serde_json::from_value(entry.clone())
                    .with_context(|| format!("invalid deviceList[{}]", i))?;
                identity
                    .validate()
                    .map_err(|e| anyhow!("invalid deviceList[{}]: {}", i, e))?;
                Ok(identity)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { devices })
    }
}
