//! Tuya Smart Meter MQTT Bridge
//!
//! Polls a Tuya-protocol energy meter over its local TCP interface, decodes
//! the raw data-point map into scaled, unit-tagged readings, and republishes
//! every reading to two MQTT sinks: an aggregate JSON document and a
//! per-measurement fan-out for emoncms.
//!
//! - [`catalog`] - Measurement catalog (data-point key to name, scale, units)
//! - [`reading`] - Decoded readings and their wire format
//! - [`device`] - Device client trait and status responses
//! - [`tuya`] - Tuya local-protocol client (framing, crypto, discovery)
//! - [`sink`] - MQTT publishing
//! - [`watchdog`] - Stall detection
//! - [`poller`] - The poll loop
//! - [`config`] - Configuration loading (JSON5 format)

pub mod catalog;
pub mod config;
pub mod device;
pub mod poller;
pub mod reading;
pub mod sink;
pub mod tuya;
pub mod watchdog;

// Re-export commonly used types at the crate root
pub use catalog::{Catalog, PointDef};
pub use config::{BridgeConfig, ConfigError, LoggingConfig};
pub use device::{DeviceClient, DeviceError, StatusResponse};
pub use poller::{MeterPoller, flat_topic, flat_value};
pub use reading::{PointValue, RawStatus, Reading, timestamp_now};
pub use sink::{MqttSink, Sink};
pub use tuya::TuyaClient;
pub use watchdog::{WATCHDOG_EXIT_CODE, Watchdog};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(())
}
