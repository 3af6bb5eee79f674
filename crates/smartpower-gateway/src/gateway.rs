//! [`Gateway`] – shared state behind every session and the command relay.

use std::sync::Arc;

use smartpower_middleware::MessageBus;
use smartpower_types::GatewayError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::codec::Frame;
use crate::config::{GatewayConfig, TopicTable};
use crate::registry::{ConnectionRegistry, DeviceConnection};
use crate::relay::CommandRelay;
use crate::response::{Response, synthesize};
use crate::router::MessageRouter;

/// Everything a session needs to process a frame: the bus, the registry,
/// the router, and the tunables.  Built once at startup and shared as
/// `Arc<Gateway>`.
pub struct Gateway {
    config: GatewayConfig,
    router: MessageRouter,
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn MessageBus>,
}

impl Gateway {
    pub fn new(bus: Arc<dyn MessageBus>, config: GatewayConfig, topics: TopicTable) -> Self {
        Self {
            config,
            router: MessageRouter::new(topics),
            registry: Arc::new(ConnectionRegistry::new()),
            bus,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Process one decoded frame received on `connection`:
    ///
    /// 1. register the frame's `DeviceID` against `connection`,
    /// 2. publish the frame text on the routed topic,
    /// 3. write the acknowledgment back to the device.
    ///
    /// A publish failure is not an error here; it becomes `Result: "0"`.
    ///
    /// # Errors
    ///
    /// Only a failure to write the acknowledgment (or to encode it).
    pub async fn handle_frame(
        &self,
        connection: &Arc<DeviceConnection>,
        frame: Frame,
    ) -> Result<Response, GatewayError> {
        let device_id = frame.device_id().to_string();
        self.registry.put(&device_id, connection.handle());

        let topic = self.router.topic_for(&frame.message);
        info!(device_id = %device_id, topic, "routing frame");
        let published = self.publish(topic, frame.text.into_bytes()).await;

        let response = synthesize(&frame.message, published);
        connection.write_all(&response.to_wire()?).await?;
        debug!(device_id = %device_id, result = %response.result, "response written");
        Ok(response)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> bool {
        let attempt = self.bus.publish(
            topic,
            payload,
            self.config.publish_qos,
            self.config.publish_retain,
        );
        match tokio::time::timeout(self.config.publish_timeout(), attempt).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(topic, error = %e, "publish failed");
                false
            }
            Err(_) => {
                error!(topic, timeout_ms = self.config.publish_timeout_ms, "publish timed out");
                false
            }
        }
    }

    /// A relay bound to this gateway's registry.
    pub fn relay(&self) -> CommandRelay {
        CommandRelay::new(Arc::clone(&self.registry))
    }

    /// Subscribe to the command topic and run the relay on its own task.
    ///
    /// # Errors
    ///
    /// [`GatewayError::BusSubscribe`] when the subscription cannot be made.
    /// Callers log it and keep serving devices without a command path.
    pub async fn spawn_relay(&self) -> Result<JoinHandle<()>, GatewayError> {
        let topic = self.router.command_topic();
        let subscription = self.bus.subscribe(topic, self.config.command_qos).await?;
        info!(topic, "command relay subscribed");
        Ok(tokio::spawn(self.relay().run(subscription)))
    }
}
