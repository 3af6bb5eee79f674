//! [`MqttBus`] – [`MessageBus`] adapter over an external MQTT broker.
//!
//! `rumqttc` splits a connection into an [`AsyncClient`] (cheap, clonable
//! request handle) and an [`EventLoop`] that must be polled for anything to
//! happen.  [`MqttBus::connect`] returns both halves wrapped: the bus for the
//! gateway core, and an [`MqttDriver`] that the caller spawns.
//!
//! The driver:
//!
//! 1. tracks the connected state (publishes fail fast while disconnected),
//! 2. re-issues every registered subscription after each `ConnAck`,
//! 3. fans inbound `Publish` packets out to every subscription whose filter
//!    matches the topic,
//! 4. completes pending publishes: QoS 0 once the packet is written to the
//!    network, QoS 1 on `PubAck`, QoS 2 on `PubComp`.
//!
//! Connection errors fail every pending publish and are logged; polling
//! resumes after [`MqttConfig::reconnect_delay_ms`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use serde::{Deserialize, Serialize};
use smartpower_types::GatewayError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, BusSubscription, MessageBus, QoS, topic_matches};

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Capacity of the request queue between the client and the event loop,
    /// and of each subscription's inbound queue.
    pub channel_capacity: usize,
    /// Upper bound on how long a publish waits for its acknowledgment.
    /// Not read from the `[bus]` section; callers copy the gateway's publish
    /// timeout in.
    #[serde(skip)]
    pub publish_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "smartpower-gateway".to_string(),
            keep_alive_secs: 30,
            channel_capacity: 64,
            publish_timeout_ms: 5_000,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

struct SubscriptionEntry {
    filter: String,
    qos: QoS,
    sender: mpsc::Sender<BusMessage>,
}

type SubscriptionTable = Arc<Mutex<Vec<SubscriptionEntry>>>;

// ---------------------------------------------------------------------------
// Publish tracking
// ---------------------------------------------------------------------------

type PublishOutcome = Result<(), String>;

struct PendingPublish {
    qos: QoS,
    done: oneshot::Sender<PublishOutcome>,
}

/// Publishes handed to the client and not yet confirmed.
///
/// The event loop writes requests in the order the client queued them, so
/// `queued` is matched against `Outgoing::Publish` events front to back.
/// QoS 1/2 publishes then wait in `inflight` under their packet id.
#[derive(Default)]
struct PublishTracker {
    queued: VecDeque<PendingPublish>,
    inflight: HashMap<u16, PendingPublish>,
}

impl PublishTracker {
    fn queue(&mut self, qos: QoS) -> oneshot::Receiver<PublishOutcome> {
        let (done, rx) = oneshot::channel();
        self.queued.push_back(PendingPublish { qos, done });
        rx
    }

    fn on_outgoing(&mut self, pkid: u16) {
        // Retransmission of a packet already written once.
        if pkid != 0 && self.inflight.contains_key(&pkid) {
            return;
        }
        let Some(pending) = self.queued.pop_front() else {
            return;
        };
        if pending.qos == QoS::AtMostOnce {
            let _ = pending.done.send(Ok(()));
        } else {
            self.inflight.insert(pkid, pending);
        }
    }

    fn on_ack(&mut self, pkid: u16) {
        if let Some(pending) = self.inflight.remove(&pkid) {
            let _ = pending.done.send(Ok(()));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        let inflight = self.inflight.drain().map(|(_, pending)| pending);
        for pending in self.queued.drain(..).chain(inflight) {
            let _ = pending.done.send(Err(reason.to_string()));
        }
    }

    fn len(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

type SharedTracker = Arc<Mutex<PublishTracker>>;

fn publish_error(topic: &str, details: impl Into<String>) -> GatewayError {
    GatewayError::BusPublish {
        topic: topic.to_string(),
        details: details.into(),
    }
}

// ---------------------------------------------------------------------------
// MqttBus
// ---------------------------------------------------------------------------

/// Clonable MQTT-backed [`MessageBus`].
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    subscriptions: SubscriptionTable,
    tracker: SharedTracker,
    connected: Arc<AtomicBool>,
    connected_rx: watch::Receiver<bool>,
    publish_timeout: Duration,
    channel_capacity: usize,
}

impl MqttBus {
    /// Build the client and its driver.  Nothing touches the network until
    /// [`MqttDriver::run`] is polled.
    pub fn connect(config: &MqttConfig) -> (Self, MqttDriver) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        // Requests left unsent by a dropped connection are discarded on
        // reconnect, which is what failing the tracker assumes.
        options.set_clean_session(true);

        let capacity = config.channel_capacity.max(1);
        let (client, event_loop) = AsyncClient::new(options, capacity);
        let subscriptions: SubscriptionTable = Arc::new(Mutex::new(Vec::new()));
        let tracker: SharedTracker = Arc::new(Mutex::new(PublishTracker::default()));
        let connected = Arc::new(AtomicBool::new(false));
        let (connected_tx, connected_rx) = watch::channel(false);

        let bus = Self {
            client: client.clone(),
            subscriptions: Arc::clone(&subscriptions),
            tracker: Arc::clone(&tracker),
            connected: Arc::clone(&connected),
            connected_rx,
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
            channel_capacity: capacity,
        };
        let driver = MqttDriver {
            event_loop,
            client,
            subscriptions,
            tracker,
            connected,
            connected_tx,
            broker: format!("{}:{}", config.host, config.port),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        };
        (bus, driver)
    }

    /// Wait until the broker has acknowledged the connection.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BusConnect`] when no `ConnAck` arrives within
    /// `timeout` or the driver has stopped.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), GatewayError> {
        let mut rx = self.connected_rx.clone();
        let wait = rx.wait_for(|connected| *connected);
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::BusConnect("mqtt driver stopped".to_string())),
            Err(_) => Err(GatewayError::BusConnect(format!(
                "no ConnAck within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Publishes waiting for the network or for a broker acknowledgment.
    pub fn pending_publishes(&self) -> usize {
        self.tracker.lock().map(|t| t.len()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    /// Resolves once the broker has confirmed the publish as far as `qos`
    /// allows: written to the network for QoS 0, `PubAck` for QoS 1,
    /// `PubComp` for QoS 2.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), GatewayError> {
        // Queue the request and its tracker entry under one lock so the
        // driver never sees one without the other.
        let confirmation = {
            let mut tracker = self
                .tracker
                .lock()
                .map_err(|_| publish_error(topic, "publish tracker poisoned"))?;
            if !self.is_connected() {
                return Err(publish_error(topic, "not connected"));
            }
            self.client
                .try_publish(topic, qos.into(), retain, payload)
                .map_err(|e| publish_error(topic, e.to_string()))?;
            tracker.queue(qos)
        };

        match tokio::time::timeout(self.publish_timeout, confirmation).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(publish_error(topic, reason)),
            Ok(Err(_)) => Err(publish_error(topic, "mqtt driver stopped")),
            Err(_) => Err(publish_error(
                topic,
                format!("not confirmed within {} ms", self.publish_timeout.as_millis()),
            )),
        }
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<BusSubscription, GatewayError> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        {
            let mut table = self.subscriptions.lock().map_err(|_| GatewayError::BusSubscribe {
                topic: topic.to_string(),
                details: "subscription table poisoned".to_string(),
            })?;
            table.push(SubscriptionEntry {
                filter: topic.to_string(),
                qos,
                sender: tx,
            });
        }
        // While disconnected the driver subscribes on the next ConnAck.
        if self.is_connected() {
            self.client
                .subscribe(topic, qos.into())
                .await
                .map_err(|e| GatewayError::BusSubscribe {
                    topic: topic.to_string(),
                    details: e.to_string(),
                })?;
        }
        Ok(BusSubscription::from_channel(topic, rx))
    }
}

// ---------------------------------------------------------------------------
// MqttDriver
// ---------------------------------------------------------------------------

/// Owns the `rumqttc` event loop.  Spawn [`MqttDriver::run`] on the runtime.
pub struct MqttDriver {
    event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: SubscriptionTable,
    tracker: SharedTracker,
    connected: Arc<AtomicBool>,
    connected_tx: watch::Sender<bool>,
    broker: String,
    reconnect_delay: Duration,
}

impl MqttDriver {
    /// Poll the event loop forever.
    pub async fn run(mut self) {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!(broker = %self.broker, "mqtt connected");
                        self.set_connected(true);
                        self.resubscribe();
                    } else {
                        warn!(broker = %self.broker, code = ?ack.code, "mqtt connection refused");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = BusMessage::new(publish.topic, publish.payload.to_vec());
                    dispatch(&self.subscriptions, message);
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => self.track(|t| t.on_ack(ack.pkid)),
                Ok(Event::Incoming(Packet::PubComp(comp))) => self.track(|t| t.on_ack(comp.pkid)),
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.track(|t| t.on_outgoing(pkid)),
                Ok(event) => debug!(?event, "mqtt event"),
                Err(e) => {
                    if self.connected.load(Ordering::SeqCst) {
                        warn!(broker = %self.broker, error = %e, "mqtt connection lost");
                    } else {
                        debug!(broker = %self.broker, error = %e, "mqtt connect attempt failed");
                    }
                    self.disconnect(&format!("connection lost: {e}"));
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.connected_tx.send_replace(connected);
    }

    fn track(&self, update: impl FnOnce(&mut PublishTracker)) {
        if let Ok(mut tracker) = self.tracker.lock() {
            update(&mut tracker);
        }
    }

    /// Mark the link down and fail every pending publish.  Done under the
    /// tracker lock so no publish slips in between.
    fn disconnect(&self, reason: &str) {
        match self.tracker.lock() {
            Ok(mut tracker) => {
                self.set_connected(false);
                tracker.fail_all(reason);
            }
            Err(_) => self.set_connected(false),
        }
    }

    /// Runs on the polling task itself, so it must not wait on the request
    /// queue.
    fn resubscribe(&self) {
        let filters: Vec<(String, QoS)> = match self.subscriptions.lock() {
            Ok(table) => table.iter().map(|e| (e.filter.clone(), e.qos)).collect(),
            Err(_) => return,
        };
        for (filter, qos) in filters {
            if let Err(e) = self.client.try_subscribe(filter.as_str(), qos.into()) {
                warn!(topic = %filter, error = %e, "mqtt resubscribe failed");
            }
        }
    }
}

/// Hand `message` to every live subscription whose filter matches its topic.
/// Subscriptions whose receiver has been dropped are pruned.
fn dispatch(subscriptions: &SubscriptionTable, message: BusMessage) {
    let Ok(mut table) = subscriptions.lock() else {
        return;
    };
    table.retain(|entry| {
        if !topic_matches(&entry.filter, &message.topic) {
            return true;
        }
        match entry.sender.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %message.topic, filter = %entry.filter, "subscription queue full, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn table_with(filter: &str) -> (SubscriptionTable, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(4);
        let table = Arc::new(Mutex::new(vec![SubscriptionEntry {
            filter: filter.to_string(),
            qos: QoS::AtMostOnce,
            sender: tx,
        }]));
        (table, rx)
    }

    #[test]
    fn dispatch_delivers_to_matching_filter() {
        let (table, mut rx) = table_with("/smartpower/command");
        dispatch(&table, BusMessage::new("/smartpower/command", "cmd"));
        let msg = rx.try_recv().expect("message delivered");
        assert_eq!(msg.payload, b"cmd");
    }

    #[test]
    fn dispatch_skips_non_matching_filter() {
        let (table, mut rx) = table_with("/smartpower/command");
        dispatch(&table, BusMessage::new("/smartpower/status", "x"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_prunes_dropped_subscriptions() {
        let (table, rx) = table_with("#");
        drop(rx);
        dispatch(&table, BusMessage::new("any", "x"));
        assert!(table.lock().unwrap().is_empty());
    }

    #[test]
    fn default_config_points_at_local_broker() {
        let cfg = MqttConfig::default();
        assert_eq!(cfg.port, 1883);
        assert_eq!(cfg.client_id, "smartpower-gateway");
    }

    // ── PublishTracker ───────────────────────────────────────────────────────

    #[test]
    fn tracker_completes_qos0_when_written() {
        let mut tracker = PublishTracker::default();
        let mut rx = tracker.queue(QoS::AtMostOnce);
        assert!(rx.try_recv().is_err());

        tracker.on_outgoing(0);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn tracker_holds_qos1_until_acked() {
        let mut tracker = PublishTracker::default();
        let mut first = tracker.queue(QoS::AtLeastOnce);
        let mut second = tracker.queue(QoS::AtLeastOnce);

        tracker.on_outgoing(7);
        tracker.on_outgoing(8);
        assert!(first.try_recv().is_err(), "written is not acknowledged");

        tracker.on_ack(8);
        assert_eq!(second.try_recv().unwrap(), Ok(()));
        assert!(first.try_recv().is_err());

        tracker.on_ack(7);
        assert_eq!(first.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn tracker_ignores_retransmissions() {
        let mut tracker = PublishTracker::default();
        let _first = tracker.queue(QoS::AtLeastOnce);
        let mut second = tracker.queue(QoS::AtLeastOnce);

        tracker.on_outgoing(1);
        tracker.on_outgoing(1);
        assert_eq!(tracker.queued.len(), 1, "retransmit must not consume the next publish");

        tracker.on_outgoing(2);
        tracker.on_ack(2);
        assert_eq!(second.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn tracker_fails_everything_on_disconnect() {
        let mut tracker = PublishTracker::default();
        let mut written = tracker.queue(QoS::AtLeastOnce);
        let mut unsent = tracker.queue(QoS::AtMostOnce);
        tracker.on_outgoing(3);

        tracker.fail_all("connection lost");
        assert!(written.try_recv().unwrap().is_err());
        assert!(unsent.try_recv().unwrap().is_err());
        assert_eq!(tracker.len(), 0);
    }

    // ── Against a loopback broker ────────────────────────────────────────────

    /// First header byte and body of one MQTT control packet.
    type RawPacket = (u8, Vec<u8>);

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;
    const SUBSCRIBE: u8 = 8;
    const PINGREQ: u8 = 12;

    /// Minimal MQTT 3.1.1 broker for one client.  Answers CONNECT, SUBSCRIBE
    /// and PINGREQ; acknowledges QoS 1 publishes only when asked to.
    struct TestBroker {
        port: u16,
        received: mpsc::UnboundedReceiver<RawPacket>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl TestBroker {
        async fn start(ack_publishes: bool) -> std::io::Result<Self> {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let port = listener.local_addr()?.port();
            let (received_tx, received) = mpsc::unbounded_channel();
            let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let replies = outbound.clone();

            tokio::spawn(async move {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (mut reader, mut writer) = stream.into_split();
                tokio::spawn(async move {
                    while let Some(bytes) = outbound_rx.recv().await {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                });
                while let Ok((header, body)) = read_packet(&mut reader).await {
                    match header >> 4 {
                        CONNECT => {
                            let _ = replies.send(vec![0x20, 0x02, 0x00, 0x00]);
                        }
                        SUBSCRIBE => {
                            let _ = replies.send(vec![0x90, 0x03, body[0], body[1], 0x00]);
                        }
                        PINGREQ => {
                            let _ = replies.send(vec![0xD0, 0x00]);
                        }
                        PUBLISH if ack_publishes && (header >> 1) & 0x03 == 1 => {
                            let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                            let pkid = [body[2 + topic_len], body[3 + topic_len]];
                            let _ = replies.send(vec![0x40, 0x02, pkid[0], pkid[1]]);
                        }
                        _ => {}
                    }
                    if received_tx.send((header, body)).is_err() {
                        break;
                    }
                }
            });
            Ok(Self { port, received, outbound })
        }

        fn config(&self) -> MqttConfig {
            MqttConfig {
                port: self.port,
                client_id: "smartpower-test".to_string(),
                publish_timeout_ms: 300,
                reconnect_delay_ms: 50,
                ..MqttConfig::default()
            }
        }

        /// Next packet of control type `kind`, skipping any others.
        async fn next_packet(&mut self, kind: u8) -> Result<RawPacket, Box<dyn std::error::Error>> {
            loop {
                let packet = tokio::time::timeout(Duration::from_secs(2), self.received.recv())
                    .await?
                    .ok_or("broker connection closed")?;
                if packet.0 >> 4 == kind {
                    return Ok(packet);
                }
            }
        }

        /// Send a QoS 0 PUBLISH to the client.
        fn publish(&self, topic: &str, payload: &[u8]) {
            let mut body = Vec::new();
            body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
            body.extend_from_slice(topic.as_bytes());
            body.extend_from_slice(payload);
            assert!(body.len() < 128, "single-byte remaining length only");
            let mut packet = vec![0x30, body.len() as u8];
            packet.extend(body);
            let _ = self.outbound.send(packet);
        }
    }

    async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<RawPacket> {
        let header = reader.read_u8().await?;
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = reader.read_u8().await?;
            remaining |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; remaining];
        reader.read_exact(&mut body).await?;
        Ok((header, body))
    }

    async fn connected_bus(broker: &TestBroker) -> Result<MqttBus, GatewayError> {
        let (bus, driver) = MqttBus::connect(&broker.config());
        tokio::spawn(driver.run());
        bus.wait_connected(Duration::from_secs(2)).await?;
        Ok(bus)
    }

    #[tokio::test]
    async fn publish_fails_fast_while_disconnected() {
        let (bus, _driver) = MqttBus::connect(&MqttConfig::default());
        let err = bus
            .publish("/smartpower/status", b"{}".to_vec(), QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BusPublish { .. }));
        assert_eq!(bus.pending_publishes(), 0);
    }

    #[tokio::test]
    async fn wait_connected_times_out_without_driver() {
        let (bus, _driver) = MqttBus::connect(&MqttConfig::default());
        let err = bus.wait_connected(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, GatewayError::BusConnect(_)));
    }

    #[tokio::test]
    async fn connack_flips_connected_flag() -> Result<(), Box<dyn std::error::Error>> {
        let mut broker = TestBroker::start(true).await?;
        let (bus, driver) = MqttBus::connect(&broker.config());
        assert!(!bus.is_connected());

        tokio::spawn(driver.run());
        broker.next_packet(CONNECT).await?;
        bus.wait_connected(Duration::from_secs(2)).await?;
        assert!(bus.is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn qos1_publish_resolves_on_puback() -> Result<(), Box<dyn std::error::Error>> {
        let mut broker = TestBroker::start(true).await?;
        let bus = connected_bus(&broker).await?;

        bus.publish("/smartpower/status", b"{}".to_vec(), QoS::AtLeastOnce, false)
            .await?;

        let (header, _) = broker.next_packet(PUBLISH).await?;
        assert_eq!(header, 0x32, "QoS 1 PUBLISH");
        assert_eq!(bus.pending_publishes(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn qos1_publish_without_puback_is_a_failure() -> Result<(), Box<dyn std::error::Error>> {
        let mut broker = TestBroker::start(false).await?;
        let bus = connected_bus(&broker).await?;

        let result = bus
            .publish("/smartpower/status", b"{}".to_vec(), QoS::AtLeastOnce, false)
            .await;

        assert!(matches!(result, Err(GatewayError::BusPublish { .. })));
        let (header, _) = broker.next_packet(PUBLISH).await?;
        assert_eq!(header, 0x32, "the broker saw the publish but never acknowledged it");
        Ok(())
    }

    #[tokio::test]
    async fn qos0_publish_resolves_once_written() -> Result<(), Box<dyn std::error::Error>> {
        let mut broker = TestBroker::start(false).await?;
        let bus = connected_bus(&broker).await?;

        bus.publish("/smartpower/status", b"payload".to_vec(), QoS::AtMostOnce, false)
            .await?;

        let (header, body) = broker.next_packet(PUBLISH).await?;
        assert_eq!(header, 0x30);
        assert!(body.ends_with(b"payload"));
        Ok(())
    }

    #[tokio::test]
    async fn offline_subscription_is_sent_after_connack_and_receives() -> Result<(), Box<dyn std::error::Error>> {
        let mut broker = TestBroker::start(true).await?;
        let (bus, driver) = MqttBus::connect(&broker.config());

        let mut subscription = bus.subscribe("/smartpower/command", QoS::AtMostOnce).await?;
        tokio::spawn(driver.run());
        bus.wait_connected(Duration::from_secs(2)).await?;

        // packet id (2) | filter length (2) | filter | requested QoS
        let (_, body) = broker.next_packet(SUBSCRIBE).await?;
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        assert_eq!(&body[4..4 + len], b"/smartpower/command");

        broker.publish("/smartpower/command", b"cmd-1");
        let message = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
            .await?
            .ok_or("subscription closed")?;
        assert_eq!(message.topic, "/smartpower/command");
        assert_eq!(message.payload, b"cmd-1");
        Ok(())
    }
}
