//! Device-client seam: the poll loop talks to the meter through this trait.

use crate::reading::RawStatus;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a device exchange.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Device returned error code {0}")]
    ReturnCode(u32),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Discovery failed: {0}")]
    Discovery(String),
}

/// A status document returned by the device.
#[derive(Debug, Clone)]
pub struct StatusResponse {
    body: serde_json::Value,
}

impl StatusResponse {
    pub fn new(body: serde_json::Value) -> Self {
        Self { body }
    }

    /// The data-point object, when the response carries one.
    ///
    /// A response without it (an error document, an empty object) counts
    /// as a failed iteration even though the exchange itself succeeded.
    pub fn dps(&self) -> Option<&RawStatus> {
        self.body.get("dps").and_then(serde_json::Value::as_object)
    }

    /// Full response body, for failure diagnostics.
    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }
}

/// A client able to fetch the device's current data-point status.
///
/// The production implementation is [`crate::tuya::TuyaClient`]; tests
/// script the sequence of outcomes with fakes.
#[async_trait]
pub trait DeviceClient {
    async fn status(&mut self) -> Result<StatusResponse, DeviceError>;
}
