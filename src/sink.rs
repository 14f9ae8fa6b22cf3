//! MQTT publishing sinks.

use crate::config::BrokerConfig;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// How long to wait for the broker to acknowledge the session at startup.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while establishing or using a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Broker refused connection: {0}")]
    Refused(String),
    #[error("Publish failed: {0}")]
    Publish(String),
}

/// A fire-and-forget publishing endpoint.
#[async_trait]
pub trait Sink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SinkError>;
}

/// An MQTT broker connection.
///
/// The event loop runs on a background task that also handles automatic
/// reconnection; publishes go out at QoS 0, not retained.
pub struct MqttSink {
    name: &'static str,
    client: AsyncClient,
}

impl MqttSink {
    /// Connect to the broker and wait for CONNACK. An unreachable or
    /// refusing broker fails here, not at the first publish.
    pub async fn connect(
        name: &'static str,
        config: &BrokerConfig,
        keep_alive: Duration,
    ) -> Result<Self, SinkError> {
        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.host.clone(),
            config.port,
        );
        options.set_keep_alive(keep_alive);
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        // Drive the event loop by hand until the first CONNACK arrives
        let code = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack.code),
                    Ok(_) => {}
                    Err(e) => return Err(SinkError::Connection(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| SinkError::Connection("Timed out waiting for CONNACK".to_string()))??;

        if code != ConnectReturnCode::Success {
            return Err(SinkError::Refused(format!("{:?}", code)));
        }

        info!(
            sink = name,
            broker = %format!("{}:{}", config.host, config.port),
            client_id = %config.client_id,
            "Connected to MQTT broker"
        );

        // Background driver from here on; rumqttc reconnects on its own
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(packet)) => {
                        debug!(sink = name, ?packet, "Received MQTT packet");
                    }
                    Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        error!(sink = name, error = %e, "MQTT connection error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(Self { name, client })
    }
}

#[async_trait]
impl Sink for MqttSink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| SinkError::Publish(e.to_string()))?;

        debug!(sink = self.name, topic = %topic, "Published");
        Ok(())
    }
}
