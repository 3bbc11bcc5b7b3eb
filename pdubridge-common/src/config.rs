use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Which transport the poller opens first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportSelector {
    #[default]
    Snmp,
    Serial,
    /// In-memory simulated PDU, first-class for tests and demo mode.
    Mock,
}

impl TransportSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportSelector::Snmp => "snmp",
            TransportSelector::Serial => "serial",
            TransportSelector::Mock => "mock",
        }
    }
}

/// Serial console settings for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0").
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_baud() -> u32 {
    9600
}

/// Configuration for a single PDU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable identifier used in topics, file names and store keys.
    /// Immutable once assigned.
    pub device_id: String,

    /// Network host or IP.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_snmp_port")]
    pub snmp_port: u16,

    #[serde(default = "default_community")]
    pub read_community: String,

    #[serde(default = "default_write_community")]
    pub write_community: String,

    /// Optional serial console fallback.
    #[serde(default)]
    pub serial: Option<SerialConfig>,

    /// Human display label.
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bank-count hint for models that misreport the bank table.
    #[serde(default)]
    pub banks: Option<u32>,

    #[serde(default)]
    pub transport: TransportSelector,
}

fn default_snmp_port() -> u16 {
    161
}

fn default_community() -> String {
    "public".to_string()
}

fn default_write_community() -> String {
    "private".to_string()
}

fn default_true() -> bool {
    true
}

impl DeviceConfig {
    /// Minimal config for a named mock device.
    pub fn mock(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            host: None,
            snmp_port: default_snmp_port(),
            read_community: default_community(),
            write_community: default_write_community(),
            serial: None,
            label: None,
            enabled: true,
            banks: None,
            transport: TransportSelector::Mock,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_device_id(&self.device_id)?;
        if self.transport == TransportSelector::Snmp && self.host.is_none() {
            return Err(Error::config(format!(
                "Device '{}' uses SNMP but has no host",
                self.device_id
            )));
        }
        if self.transport == TransportSelector::Serial && self.serial.is_none() {
            return Err(Error::config(format!(
                "Device '{}' uses the serial console but has no serial settings",
                self.device_id
            )));
        }
        Ok(())
    }
}

/// Device ids become topic segments and file names, so the MQTT topic
/// separator and wildcards are forbidden, as is whitespace.
pub fn validate_device_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::config("device_id cannot be empty"));
    }
    if let Some(c) = id
        .chars()
        .find(|c| matches!(c, '/' | '#' | '+') || c.is_whitespace())
    {
        return Err(Error::config(format!(
            "device_id '{}' contains forbidden character '{}'",
            id, c
        )));
    }
    Ok(())
}

/// Runtime knobs persisted in `bridge_settings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Poll interval in milliseconds; floor 1000.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// When set, every mutating HTTP endpoint requires a session.
    #[serde(default)]
    pub web_password: Option<String>,

    /// History retention window in days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_retention_days() -> u32 {
    60
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            web_password: None,
            retention_days: default_retention_days(),
        }
    }
}

impl BridgeSettings {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms < 1000 {
            return Err(Error::config("poll_interval_ms must be at least 1000"));
        }
        if self.retention_days == 0 {
            return Err(Error::config("retention_days must be at least 1"));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Parse a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_validation() {
        assert!(validate_device_id("rack1-pdu").is_ok());
        assert!(validate_device_id("pdu44001").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("a/b").is_err());
        assert!(validate_device_id("a#b").is_err());
        assert!(validate_device_id("a+b").is_err());
        assert!(validate_device_id("a b").is_err());
    }

    #[test]
    fn test_parse_device_config() {
        let json5 = r#"
        {
            device_id: "rack1-pdu",
            host: "192.168.1.50",
            read_community: "public",
            serial: { port: "/dev/ttyUSB0", baud: 9600 },
        }
        "#;

        let device: DeviceConfig = parse_config(json5).unwrap();
        assert_eq!(device.device_id, "rack1-pdu");
        assert_eq!(device.snmp_port, 161);
        assert_eq!(device.write_community, "private");
        assert!(device.enabled);
        assert_eq!(device.transport, TransportSelector::Snmp);
        assert_eq!(device.serial.unwrap().baud, 9600);
    }

    #[test]
    fn test_device_validation_requires_host() {
        let device = DeviceConfig {
            host: None,
            ..DeviceConfig::mock("x")
        };
        let device = DeviceConfig {
            transport: TransportSelector::Snmp,
            ..device
        };
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_settings_floor() {
        let settings = BridgeSettings {
            poll_interval_ms: 500,
            ..BridgeSettings::default()
        };
        assert!(settings.validate().is_err());
        assert!(BridgeSettings::default().validate().is_ok());
    }
}
