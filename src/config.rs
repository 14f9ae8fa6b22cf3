//! Configuration for the Tuya MQTT bridge.

use crate::tuya::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Device connection settings
    pub device: DeviceConfig,

    /// MQTT sink settings
    pub mqtt: MqttConfig,

    /// Seconds between poll iterations
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Watchdog deadline in seconds; must exceed the poll interval
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_secs: u64,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_watchdog_timeout() -> u64 {
    60
}

/// Tuya device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device id as registered with the vendor cloud
    pub id: String,

    /// Device IP address, or "Auto" to find it by broadcast discovery
    #[serde(default = "default_address")]
    pub address: String,

    /// Per-device local encryption key (16 characters)
    pub local_key: String,

    /// Protocol version: "3.1" or "3.3"
    #[serde(default = "default_version")]
    pub version: String,

    /// TCP port the device listens on
    #[serde(default = "default_device_port")]
    pub port: u16,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_address() -> String {
    "Auto".to_string()
}

fn default_version() -> String {
    "3.3".to_string()
}

fn default_device_port() -> u16 {
    6668
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Both MQTT sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Aggregate JSON sink
    pub telemetry: TelemetrySinkConfig,

    /// Per-measurement fan-out sink
    pub emoncms: EmoncmsSinkConfig,
}

/// Broker connection settings shared by both sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname or IP
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// MQTT client identifier; must differ between sinks sharing a broker
    pub client_id: String,

    /// Optional username
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

/// Settings for the aggregate-JSON sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySinkConfig {
    /// Broker connection
    pub broker: BrokerConfig,

    /// Topic the aggregate reading is published to
    #[serde(default = "default_telemetry_topic")]
    pub topic: String,
}

fn default_telemetry_topic() -> String {
    "tele/Meter/data".to_string()
}

/// Settings for the per-measurement fan-out sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmoncmsSinkConfig {
    /// Broker connection
    pub broker: BrokerConfig,

    /// Per-measurement topics are this prefix plus the measurement name
    #[serde(default = "default_emoncms_prefix")]
    pub topic_prefix: String,
}

fn default_emoncms_prefix() -> String {
    "emon/ASHP".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.id.is_empty() {
            return Err(ConfigError::Validation(
                "Device id cannot be empty".to_string(),
            ));
        }

        if ProtocolVersion::parse(&self.device.version).is_none() {
            return Err(ConfigError::Validation(format!(
                "Unsupported protocol version '{}': 3.4+ devices negotiate a session key \
                 and are not supported, use 3.1 or 3.3",
                self.device.version
            )));
        }

        if self.device.version == "3.3" && self.device.local_key.len() != 16 {
            return Err(ConfigError::Validation(format!(
                "local_key must be 16 characters for version 3.3, got {}",
                self.device.local_key.len()
            )));
        }

        if !self.device.address.eq_ignore_ascii_case("auto")
            && self.device.address.parse::<std::net::IpAddr>().is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Device address must be an IP address or \"Auto\", got '{}'",
                self.device.address
            )));
        }

        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }

        // The idle sleep between polls alone must not trip the watchdog
        if self.watchdog_timeout_secs <= self.poll_interval_secs {
            return Err(ConfigError::Validation(format!(
                "watchdog_timeout_secs ({}) must be greater than poll_interval_secs ({})",
                self.watchdog_timeout_secs, self.poll_interval_secs
            )));
        }

        for (name, broker) in [
            ("telemetry", &self.mqtt.telemetry.broker),
            ("emoncms", &self.mqtt.emoncms.broker),
        ] {
            if broker.host.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Sink '{}': host cannot be empty",
                    name
                )));
            }
            if broker.client_id.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Sink '{}': client_id cannot be empty",
                    name
                )));
            }
            // A lone username or password would silently connect anonymously
            if broker.username.is_some() != broker.password.is_some() {
                return Err(ConfigError::Validation(format!(
                    "Sink '{}': username and password must be set together",
                    name
                )));
            }
        }

        if self.mqtt.telemetry.topic.is_empty() {
            return Err(ConfigError::Validation(
                "Telemetry topic cannot be empty".to_string(),
            ));
        }

        if self.mqtt.emoncms.topic_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "Emoncms topic_prefix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Sink keep-alive: long enough that the idle gap between polls does
    /// not drop the broker connection.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs + 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"{
            device: { id: "bf1234567890abcdef", local_key: "0123456789abcdef" },
            mqtt: {
                telemetry: { broker: { host: "192.168.1.10", client_id: "tuya-tele" } },
                emoncms: { broker: { host: "emonpi", client_id: "tuya-emon" } },
            },
        }"#
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: BridgeConfig = json5::from_str(minimal()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.device.address, "Auto");
        assert_eq!(config.device.version, "3.3");
        assert_eq!(config.device.port, 6668);
        assert_eq!(config.device.timeout_ms, 5000);
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.watchdog_timeout_secs, 60);
        assert_eq!(config.logging.level, "info");

        assert_eq!(config.mqtt.telemetry.broker.port, 1883);
        assert_eq!(config.mqtt.telemetry.topic, "tele/Meter/data");
        assert_eq!(config.mqtt.emoncms.topic_prefix, "emon/ASHP");
        assert!(config.mqtt.telemetry.broker.username.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            device: {
                id: "bf1234567890abcdef",
                address: "192.168.1.50",
                local_key: "0123456789abcdef",
                version: "3.1",
                port: 6669,
                timeout_ms: 2000,
            },
            mqtt: {
                telemetry: {
                    broker: { host: "broker1", port: 1884, client_id: "tele" },
                    topic: "tele/House/data",
                },
                emoncms: {
                    broker: {
                        host: "emonpi",
                        client_id: "emon",
                        username: "emonpi",
                        password: "emonpimqtt2016",
                    },
                    topic_prefix: "emon/heatpump",
                },
            },
            poll_interval_secs: 10,
            watchdog_timeout_secs: 45,
            logging: { level: "debug" },
        }"#;

        let config: BridgeConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.device.address, "192.168.1.50");
        assert_eq!(config.device.version, "3.1");
        assert_eq!(config.mqtt.telemetry.topic, "tele/House/data");
        assert_eq!(
            config.mqtt.emoncms.broker.username.as_deref(),
            Some("emonpi")
        );
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.keep_alive(), Duration::from_secs(20));
    }

    fn with_overrides(overrides: &str) -> BridgeConfig {
        let json = format!(
            r#"{{
                device: {{ id: "bfdev", local_key: "0123456789abcdef", {} }},
                mqtt: {{
                    telemetry: {{ broker: {{ host: "h1", client_id: "c1" }} }},
                    emoncms: {{ broker: {{ host: "h2", client_id: "c2" }} }},
                }},
            }}"#,
            overrides
        );
        json5::from_str(&json).unwrap()
    }

    #[test]
    fn test_validate_rejects_newer_versions() {
        let config = with_overrides(r#"version: "3.4""#);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("session key"));
    }

    #[test]
    fn test_validate_rejects_short_key() {
        let json = r#"{
            device: { id: "bfdev", local_key: "too-short" },
            mqtt: {
                telemetry: { broker: { host: "h1", client_id: "c1" } },
                emoncms: { broker: { host: "h2", client_id: "c2" } },
            },
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_key_not_required_for_v31() {
        let json = r#"{
            device: { id: "bfdev", local_key: "", version: "3.1", address: "10.0.0.2" },
            mqtt: {
                telemetry: { broker: { host: "h1", client_id: "c1" } },
                emoncms: { broker: { host: "h2", client_id: "c2" } },
            },
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let config = with_overrides(r#"address: "not-an-ip""#);
        assert!(config.validate().is_err());

        let auto = with_overrides(r#"address: "auto""#);
        auto.validate().unwrap();
    }

    #[test]
    fn test_validate_watchdog_must_exceed_interval() {
        let json = r#"{
            device: { id: "bfdev", local_key: "0123456789abcdef" },
            mqtt: {
                telemetry: { broker: { host: "h1", client_id: "c1" } },
                emoncms: { broker: { host: "h2", client_id: "c2" } },
            },
            poll_interval_secs: 60,
            watchdog_timeout_secs: 60,
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_partial_credentials() {
        let json = r#"{
            device: { id: "bfdev", local_key: "0123456789abcdef" },
            mqtt: {
                telemetry: { broker: { host: "h1", client_id: "c1" } },
                emoncms: { broker: { host: "h2", client_id: "c2", username: "emonpi" } },
            },
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("together"));

        // The full pair passes (covered again by the full-config test)
        let json = r#"{
            device: { id: "bfdev", local_key: "0123456789abcdef" },
            mqtt: {
                telemetry: { broker: { host: "h1", client_id: "c1" } },
                emoncms: {
                    broker: { host: "h2", client_id: "c2", username: "emonpi", password: "secret" },
                },
            },
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let json = r#"{
            device: { id: "", local_key: "0123456789abcdef" },
            mqtt: {
                telemetry: { broker: { host: "h1", client_id: "c1" } },
                emoncms: { broker: { host: "h2", client_id: "c2" } },
            },
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
