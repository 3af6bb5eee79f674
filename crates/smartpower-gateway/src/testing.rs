//! Test doubles shared by the gateway's unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use smartpower_middleware::{BusSubscription, EventBus, MessageBus, QoS};
use smartpower_types::GatewayError;

/// Bus that records every publish and forwards it to an in-process
/// [`EventBus`].  Flip [`set_failing`](Self::set_failing) to make publishes
/// fail.
#[derive(Default)]
pub(crate) struct RecordingBus {
    pub(crate) inner: EventBus,
    published: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl RecordingBus {
    pub(crate) fn failing() -> Self {
        let bus = Self::default();
        bus.set_failing(true);
        bus
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(topic, payload)` for every publish attempt, failed ones included.
    pub(crate) fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), GatewayError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), String::from_utf8_lossy(&payload).into_owned()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::BusPublish {
                topic: topic.to_string(),
                details: "broker unreachable".to_string(),
            });
        }
        self.inner.publish(topic, payload, qos, retain).await
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<BusSubscription, GatewayError> {
        self.inner.subscribe(topic, qos).await
    }
}

/// Bus whose publishes never complete and whose subscribes always fail.
pub(crate) struct StalledBus;

#[async_trait]
impl MessageBus for StalledBus {
    async fn publish(&self, _: &str, _: Vec<u8>, _: QoS, _: bool) -> Result<(), GatewayError> {
        std::future::pending().await
    }

    async fn subscribe(&self, topic: &str, _: QoS) -> Result<BusSubscription, GatewayError> {
        Err(GatewayError::BusSubscribe {
            topic: topic.to_string(),
            details: "not connected".to_string(),
        })
    }
}
