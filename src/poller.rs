//! Meter poll loop: fetch, decode, publish, with transition-only logging.

use crate::catalog::Catalog;
use crate::config::BridgeConfig;
use crate::device::DeviceClient;
use crate::reading::{Reading, timestamp_now};
use crate::sink::Sink;
use crate::watchdog::Watchdog;
use std::time::Duration;
use tracing::{error, info, warn};

/// Quiet-on-success, loud-on-failure log gating.
///
/// A healthy steady state emits nothing; every positive decision here
/// marks a transition worth one log line. A failure clears the success
/// flag, so the first recovery after any failure announces itself again.
#[derive(Debug, Default)]
pub struct ScanState {
    successful_scan: bool,
    error_state: bool,
}

impl ScanState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the upcoming fetch should be announced: true on the very
    /// first iteration and on every iteration while recovering.
    pub fn should_announce(&self) -> bool {
        !self.successful_scan || self.error_state
    }

    /// Mark a successful iteration. True when this success starts a new
    /// streak and deserves its one log line.
    pub fn record_success(&mut self) -> bool {
        let announce = !self.successful_scan;
        self.successful_scan = true;
        self.error_state = false;
        announce
    }

    /// Mark a failed iteration. True when this failure starts a new
    /// streak; repeats of the same streak stay silent.
    pub fn record_failure(&mut self) -> bool {
        self.successful_scan = false;
        let announce = !self.error_state;
        self.error_state = true;
        announce
    }
}

/// The wiring for the poll loop: device, catalog, both sinks, watchdog.
pub struct MeterPoller<D, T, E> {
    device: D,
    catalog: Catalog,
    telemetry: T,
    telemetry_topic: String,
    emoncms: E,
    emoncms_prefix: String,
    interval: Duration,
    watchdog: Watchdog,
    state: ScanState,
}

impl<D, T, E> MeterPoller<D, T, E>
where
    D: DeviceClient,
    T: Sink,
    E: Sink,
{
    pub fn new(
        device: D,
        catalog: Catalog,
        telemetry: T,
        emoncms: E,
        watchdog: Watchdog,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            device,
            catalog,
            telemetry,
            telemetry_topic: config.mqtt.telemetry.topic.clone(),
            emoncms,
            emoncms_prefix: config.mqtt.emoncms.topic_prefix.clone(),
            interval: Duration::from_secs(config.poll_interval_secs),
            watchdog,
            state: ScanState::new(),
        }
    }

    /// Run forever. The loop has no exit path of its own; termination
    /// comes from the watchdog or an external signal.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            points = self.catalog.len(),
            topic = %self.telemetry_topic,
            prefix = %self.emoncms_prefix,
            "Starting meter poll loop"
        );

        loop {
            self.poll_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One iteration: arm the watchdog, fetch, decode, publish.
    async fn poll_once(&mut self) {
        self.watchdog.arm();
        let time = timestamp_now();

        if self.state.should_announce() {
            info!("Requesting device status");
        }

        match self.device.status().await {
            Ok(response) => match response.dps() {
                Some(raw) => {
                    if self.state.record_success() {
                        info!("Publishing meter data");
                    }
                    let reading = Reading::decode(time, raw, &self.catalog);
                    self.publish(&reading).await;
                }
                None => {
                    if self.state.record_failure() {
                        error!(response = %response.body(), "Scan returned no data points");
                    }
                }
            },
            Err(e) => {
                if self.state.record_failure() {
                    error!(error = %e, "Scan failed");
                }
            }
        }
    }

    /// Push one decoded reading to both sinks. Publish failures are
    /// logged and otherwise ignored; the next interval tries again.
    async fn publish(&self, reading: &Reading) {
        match serde_json::to_vec(reading) {
            Ok(payload) => {
                if let Err(e) = self.telemetry.publish(&self.telemetry_topic, payload).await {
                    warn!(topic = %self.telemetry_topic, error = %e, "Aggregate publish failed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode reading"),
        }

        for (name, value) in reading.flat() {
            let topic = flat_topic(&self.emoncms_prefix, &name);
            if let Err(e) = self
                .emoncms
                .publish(&topic, flat_value(value).into_bytes())
                .await
            {
                warn!(topic = %topic, error = %e, "Flat publish failed");
            }
        }
    }
}

/// Build the fan-out topic for one measurement.
pub fn flat_topic(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

/// Stringify a flat value. Integral results keep one decimal ("125.0",
/// never "125"), the same form the aggregate JSON encoder emits.
pub fn flat_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}
