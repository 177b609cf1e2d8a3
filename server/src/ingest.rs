//! MQTT ingestion adapter.
//!
//! Subscribes to every topic under the configured prefix (`<prefix>#`) and
//! forwards each received payload, unmodified, to the hub's [`Publisher`].
//!
//! The adapter runs as its own task and only talks to the hub through the
//! ingestion queue. Broker connection errors are logged and retried; they
//! never take the process down.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broadcast::Publisher;

/// Keep-alive interval sent to the broker.
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Pause before polling again after a connection error.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Capacity of the request channel between client and event loop.
const REQUEST_CAPACITY: usize = 64;

/// Broker connection settings for the ingestion adapter.
#[derive(Clone)]
pub struct IngestConfig {
    /// Broker host name or address.
    pub host: String,

    /// Broker TCP port.
    pub port: u16,

    /// Optional `(username, password)` pair.
    pub credentials: Option<(String, String)>,

    /// Topic prefix; the adapter subscribes to `<prefix>#`.
    pub topic_prefix: String,

    /// MQTT client identifier.
    pub client_id: String,
}

impl IngestConfig {
    /// Returns the wildcard filter covering every sub-topic of the prefix.
    pub fn subscription_filter(&self) -> String {
        subscription_filter(&self.topic_prefix)
    }
}

impl std::fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "username",
                &self.credentials.as_ref().map(|(user, _)| user.as_str()),
            )
            .field("topic_prefix", &self.topic_prefix)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Builds the wildcard subscription for a topic prefix.
///
/// The prefix is used verbatim, so `sensors/` yields `sensors/#` and an empty
/// prefix subscribes to every topic.
pub fn subscription_filter(prefix: &str) -> String {
    format!("{prefix}#")
}

/// Extracts the payload of an incoming publish; other events yield `None`.
pub fn decode_event(event: &Event) -> Option<Bytes> {
    match event {
        Event::Incoming(Packet::Publish(publish)) => Some(publish.payload.clone()),
        _ => None,
    }
}

/// MQTT client feeding the broadcast hub.
pub struct MqttIngestor {
    client: AsyncClient,
    eventloop: EventLoop,
    filter: String,
}

impl MqttIngestor {
    /// Creates the client. No connection is made until the ingestor runs.
    pub fn new(config: &IngestConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some((username, password)) = &config.credentials {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            client,
            eventloop,
            filter: config.subscription_filter(),
        }
    }

    /// Spawns the ingestion task.
    pub fn spawn(self, publisher: Publisher) -> JoinHandle<()> {
        tokio::spawn(self.run(publisher))
    }

    /// Polls the broker until the hub stops accepting payloads.
    pub async fn run(mut self, publisher: Publisher) {
        info!(filter = %self.filter, "MQTT ingestion starting");

        loop {
            let event = match self.eventloop.poll().await {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "MQTT connection error, retrying");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };

            if let Event::Incoming(Packet::ConnAck(_)) = &event {
                // Subscriptions do not survive a clean-session reconnect.
                match self.client.try_subscribe(&self.filter, QoS::AtMostOnce) {
                    Ok(()) => info!(filter = %self.filter, "Subscribed to MQTT topics"),
                    Err(err) => warn!(filter = %self.filter, error = %err, "MQTT subscribe failed"),
                }
                continue;
            }

            let Some(payload) = decode_event(&event) else {
                trace!(event = ?event, "Ignoring MQTT event");
                continue;
            };

            debug!(bytes = payload.len(), "MQTT payload received");
            if publisher.publish(payload).is_err() {
                info!("Broadcast hub closed, stopping MQTT ingestion");
                break;
            }
        }

        if let Err(err) = self.client.try_disconnect() {
            debug!(error = %err, "MQTT disconnect failed");
        }
    }
}

impl std::fmt::Debug for MqttIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttIngestor")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}
