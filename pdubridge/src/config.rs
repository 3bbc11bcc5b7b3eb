//! Root bridge configuration.
//!
//! Loaded from a JSON5 file, then overlaid with `PDUBRIDGE_*` environment
//! variables. Unknown keys under that prefix are rejected so a typo never
//! silently falls back to a default.

use serde::{Deserialize, Serialize};
use std::path::Path;

use pdubridge_common::config::{BridgeSettings, DeviceConfig, LoggingConfig, parse_config};
use pdubridge_common::error::{Error, Result};
use pdubridge_core::mqtt::MqttSettings;

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Root configuration for the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub mqtt: MqttSettings,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub settings: BridgeSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

const ENV_PREFIX: &str = "PDUBRIDGE_";

impl BridgeConfig {
    /// Load from a JSON5 file; a missing file yields the defaults so an
    /// env-only deployment needs no file at all.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::config(format!("Failed to read '{}': {}", path.display(), e))
            })?;
            parse_config(&content)?
        } else {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            Self {
                data_dir: default_data_dir(),
                ..Self::default()
            }
        };

        if config.data_dir.is_empty() {
            config.data_dir = default_data_dir();
        }

        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Overlay environment variables. Unknown `PDUBRIDGE_*` keys error out.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env_device: Option<DeviceConfig> = None;

        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match name {
                "DATA_DIR" => self.data_dir = value,
                "MQTT_HOST" => self.mqtt.host = value,
                "MQTT_PORT" => self.mqtt.port = parse_env(name, &value)?,
                "MQTT_USERNAME" => self.mqtt.username = Some(value),
                "MQTT_PASSWORD" => self.mqtt.password = Some(value),
                "MQTT_CLIENT_ID" => self.mqtt.client_id = value,
                "HTTP_LISTEN" => self.http.listen = value,
                "POLL_INTERVAL_MS" => self.settings.poll_interval_ms = parse_env(name, &value)?,
                "RETENTION_DAYS" => self.settings.retention_days = parse_env(name, &value)?,
                "WEB_PASSWORD" => self.settings.web_password = Some(value),
                "LOG_LEVEL" => self.logging.level = value,
                "DEVICE_ID" => env_device_mut(&mut env_device).device_id = value,
                "DEVICE_HOST" => env_device_mut(&mut env_device).host = Some(value),
                "DEVICE_SNMP_PORT" => {
                    env_device_mut(&mut env_device).snmp_port = parse_env(name, &value)?
                }
                "DEVICE_COMMUNITY" => env_device_mut(&mut env_device).read_community = value,
                "DEVICE_WRITE_COMMUNITY" => {
                    env_device_mut(&mut env_device).write_community = value
                }
                other => {
                    return Err(Error::config(format!(
                        "unknown environment variable {}{}",
                        ENV_PREFIX, other
                    )));
                }
            }
        }

        // An env-described device only applies when the file lists none.
        if let Some(mut device) = env_device {
            if self.devices.is_empty() {
                if device.host.is_some() {
                    device.transport = pdubridge_common::TransportSelector::Snmp;
                }
                self.devices.push(device);
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.device_id.as_str()) {
                return Err(Error::config(format!(
                    "duplicate device_id '{}'",
                    device.device_id
                )));
            }
        }
        Ok(())
    }
}

fn env_device_mut(slot: &mut Option<DeviceConfig>) -> &mut DeviceConfig {
    slot.get_or_insert_with(|| {
        let mut device = DeviceConfig::mock("pdu-01");
        device.transport = pdubridge_common::TransportSelector::Mock;
        device
    })
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::config(format!(
            "invalid value '{}' for {}{}",
            value, ENV_PREFIX, name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let json5 = r#"
        {
            data_dir: "/var/lib/pdubridge",
            mqtt: { host: "broker.local", port: 1883 },
            http: { listen: "127.0.0.1:9090" },
            settings: { poll_interval_ms: 2000, retention_days: 30 },
            logging: { level: "debug" },
            devices: [
                { device_id: "rack1-pdu", host: "192.168.1.50" },
            ],
        }
        "#;

        let config: BridgeConfig = parse_config(json5).unwrap();
        config.validate().unwrap();

        assert_eq!(config.data_dir, "/var/lib/pdubridge");
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.http.listen, "127.0.0.1:9090");
        assert_eq!(config.settings.poll_interval_ms, 2000);
        assert_eq!(config.devices.len(), 1);
    }

    #[test]
    fn test_env_overlay() {
        let mut config = BridgeConfig::default();
        config
            .apply_env(vec![
                ("PDUBRIDGE_MQTT_HOST".to_string(), "broker".to_string()),
                ("PDUBRIDGE_POLL_INTERVAL_MS".to_string(), "1500".to_string()),
                ("PDUBRIDGE_DEVICE_ID".to_string(), "envpdu".to_string()),
                ("PDUBRIDGE_DEVICE_HOST".to_string(), "10.0.0.9".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ])
            .unwrap();

        assert_eq!(config.mqtt.host, "broker");
        assert_eq!(config.settings.poll_interval_ms, 1500);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].device_id, "envpdu");
        assert_eq!(
            config.devices[0].transport,
            pdubridge_common::TransportSelector::Snmp
        );
    }

    #[test]
    fn test_env_unknown_key_rejected() {
        let mut config = BridgeConfig::default();
        let result = config.apply_env(vec![(
            "PDUBRIDGE_TYPO_KEY".to_string(),
            "x".to_string(),
        )]);
        assert!(result.is_err());
    }

    #[test]
    fn test_file_devices_beat_env_device() {
        let mut config = BridgeConfig {
            devices: vec![DeviceConfig::mock("from-file")],
            ..BridgeConfig::default()
        };
        config
            .apply_env(vec![(
                "PDUBRIDGE_DEVICE_ID".to_string(),
                "from-env".to_string(),
            )])
            .unwrap();

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].device_id, "from-file");
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = BridgeConfig::default();
        let result = config.apply_env(vec![(
            "PDUBRIDGE_MQTT_PORT".to_string(),
            "not-a-port".to_string(),
        )]);
        assert!(result.is_err());
    }
}
