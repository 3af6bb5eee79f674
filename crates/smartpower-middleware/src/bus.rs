//! Topic-based publish/subscribe seam.
//!
//! [`MessageBus`] is the narrow interface the gateway core needs from a
//! broker: publish a payload to a topic and subscribe to a topic.  Two
//! implementations ship with this crate:
//!
//! | Implementation | Transport |
//! |---|---|
//! | [`EventBus`] | In-process Tokio broadcast channels, one per topic |
//! | [`MqttBus`][crate::mqtt::MqttBus] | An external MQTT broker via `rumqttc` |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smartpower_types::GatewayError;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

/// Default channel capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// QoS
// ---------------------------------------------------------------------------

/// Delivery guarantee requested from the bus.  Serialised as `0`, `1`, `2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}, expected 0, 1 or 2")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// BusMessage / BusSubscription
// ---------------------------------------------------------------------------

/// One message delivered by the bus to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

enum SubscriptionSource {
    Broadcast(broadcast::Receiver<BusMessage>),
    Channel(mpsc::Receiver<BusMessage>),
}

/// Stream of messages arriving on one subscribed topic filter.
///
/// Obtained via [`MessageBus::subscribe`].
pub struct BusSubscription {
    topic: String,
    source: SubscriptionSource,
}

impl BusSubscription {
    pub(crate) fn from_broadcast(topic: impl Into<String>, rx: broadcast::Receiver<BusMessage>) -> Self {
        Self {
            topic: topic.into(),
            source: SubscriptionSource::Broadcast(rx),
        }
    }

    pub(crate) fn from_channel(topic: impl Into<String>, rx: mpsc::Receiver<BusMessage>) -> Self {
        Self {
            topic: topic.into(),
            source: SubscriptionSource::Channel(rx),
        }
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the bus has shut down and no further messages will
    /// arrive.  A subscriber that falls behind on the in-process bus loses
    /// the oldest messages; the loss is logged and reception continues.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        match &mut self.source {
            SubscriptionSource::Channel(rx) => rx.recv().await,
            SubscriptionSource::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(msg) => return Some(msg),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic = %self.topic, lagged_by = n, "bus subscription lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    /// The topic filter this subscription is bound to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// The interface the gateway needs from a publish/subscribe transport.
///
/// # Contract
///
/// * `publish` resolves once the bus has accepted the payload (or the
///   attempt has failed).  The caller treats `Err` as "not delivered" and
///   never retries.
/// * `subscribe` returns a [`BusSubscription`] whose messages arrive on the
///   bus's own execution context, independent of any caller.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), GatewayError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<BusSubscription, GatewayError>;
}

// ---------------------------------------------------------------------------
// EventBus (in-process)
// ---------------------------------------------------------------------------

/// In-process bus.  Clone it cheaply – all clones share the same underlying
/// broadcast channels.
///
/// Each topic gets its own channel, created on first use.  Topics are matched
/// exactly; MQTT wildcards are not interpreted.  Publishing to a topic nobody
/// listens on succeeds, the same as handing a message to a broker.
#[derive(Clone, Debug)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<BusMessage>>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus.  `capacity` is applied to every topic channel
    /// independently.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Publish `payload` on `topic`, returning the number of subscribers
    /// that were handed the message.
    pub fn publish_to(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<usize, GatewayError> {
        let sender = self.topic_sender(topic)?;
        // A send error only means nobody is subscribed right now.
        Ok(sender.send(BusMessage::new(topic, payload)).unwrap_or(0))
    }

    /// Subscribe to `topic`.
    pub fn subscribe_to(&self, topic: &str) -> Result<BusSubscription, GatewayError> {
        let sender = self.topic_sender(topic)?;
        Ok(BusSubscription::from_broadcast(topic, sender.subscribe()))
    }

    fn topic_sender(&self, topic: &str) -> Result<broadcast::Sender<BusMessage>, GatewayError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| GatewayError::BusConnect("event bus topic table poisoned".to_string()))?;
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageBus for EventBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _qos: QoS,
        _retain: bool,
    ) -> Result<(), GatewayError> {
        self.publish_to(topic, payload).map(|_| ())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<BusSubscription, GatewayError> {
        self.subscribe_to(topic)
    }
}

// ---------------------------------------------------------------------------
// Topic filters
// ---------------------------------------------------------------------------

/// MQTT topic-filter matching: `+` matches exactly one level, a trailing `#`
/// matches the parent level and everything below it.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
