//! MQTT bridge for Tuya smart energy meters.
//!
//! This bridge polls a Tuya-protocol meter over its local TCP interface and
//! republishes decoded readings to two MQTT sinks (aggregate JSON telemetry
//! and per-measurement emoncms fan-out).

use anyhow::{Context, Result};
use clap::Parser;
use mqtt_bridge_tuya::catalog::Catalog;
use mqtt_bridge_tuya::config::{BridgeConfig, LoggingConfig};
use mqtt_bridge_tuya::poller::MeterPoller;
use mqtt_bridge_tuya::sink::MqttSink;
use mqtt_bridge_tuya::tuya::TuyaClient;
use mqtt_bridge_tuya::watchdog::Watchdog;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// MQTT bridge for Tuya smart energy meters.
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-tuya")]
#[command(about = "Polls a Tuya energy meter and publishes to MQTT")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "tuya.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
    };
    mqtt_bridge_tuya::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting mqtt-bridge-tuya");
    info!("Loaded configuration from {:?}", args.config);

    // Connect both sinks up front so a bad broker address fails fast
    let keep_alive = config.keep_alive();
    let telemetry = MqttSink::connect("telemetry", &config.mqtt.telemetry.broker, keep_alive)
        .await
        .with_context(|| {
            format!(
                "Failed to connect telemetry sink to {}:{}",
                config.mqtt.telemetry.broker.host, config.mqtt.telemetry.broker.port
            )
        })?;
    let emoncms = MqttSink::connect("emoncms", &config.mqtt.emoncms.broker, keep_alive)
        .await
        .with_context(|| {
            format!(
                "Failed to connect emoncms sink to {}:{}",
                config.mqtt.emoncms.broker.host, config.mqtt.emoncms.broker.port
            )
        })?;

    // Resolves the device address here when discovery is configured
    let device = TuyaClient::new(&config.device)
        .await
        .context("Failed to set up device client")?;

    let watchdog = Watchdog::spawn(Duration::from_secs(config.watchdog_timeout_secs));

    let poller = MeterPoller::new(
        device,
        Catalog::energy_meter(),
        telemetry,
        emoncms,
        watchdog,
        &config,
    );

    let task = tokio::spawn(async move {
        poller.run().await;
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    task.abort();
    info!("Tuya bridge stopped");

    Ok(())
}
