//! [`CommandRelay`] – carries bus commands back to device connections.
//!
//! Every message on the command topic is expected to be a device frame
//! (optionally wrapped in `**` delimiters) naming its target in `DeviceID`.
//! The relay looks that device up in the registry and writes the original
//! payload bytes to its connection, untouched.
//!
//! Delivery is fire-and-forget: undecodable commands, unknown devices and
//! closed connections are logged and dropped.  Nothing is acknowledged back
//! to the bus.

use std::sync::Arc;

use smartpower_middleware::BusSubscription;
use smartpower_types::{DEVICE_ID_FIELD, DeviceMessage, GatewayError};
use tracing::{Instrument, error, info, info_span, warn};

use crate::codec::FRAME_DELIMITER_STR;
use crate::registry::ConnectionRegistry;

/// What happened to one relayed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { device_id: String },
    Undecodable,
    UnknownDevice(String),
    ConnectionClosed(String),
    WriteFailed(String),
}

/// Resolves command targets through the [`ConnectionRegistry`].
#[derive(Clone, Debug)]
pub struct CommandRelay {
    registry: Arc<ConnectionRegistry>,
}

impl CommandRelay {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Relay one command payload.
    pub async fn relay(&self, payload: &[u8]) -> RelayOutcome {
        let text = String::from_utf8_lossy(payload);
        info!(payload = %text, "command received");

        let device_id = match target_device(&text) {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "command decode error");
                return RelayOutcome::Undecodable;
            }
        };

        let handle = match self.registry.get(&device_id) {
            Ok(handle) => handle,
            Err(_) => {
                warn!(device_id = %device_id, "command for unknown device dropped");
                return RelayOutcome::UnknownDevice(device_id);
            }
        };

        match handle.write_all(payload).await {
            Ok(()) => {
                info!(device_id = %device_id, peer = handle.peer(), "command delivered");
                RelayOutcome::Delivered { device_id }
            }
            Err(GatewayError::ClosedConnection(_)) => {
                warn!(device_id = %device_id, "command for closed connection dropped");
                RelayOutcome::ConnectionClosed(device_id)
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "command write failed");
                RelayOutcome::WriteFailed(device_id)
            }
        }
    }

    /// Drain `subscription`, relaying each message on its own task.
    ///
    /// Returns when the bus closes the subscription.
    pub async fn run(self, mut subscription: BusSubscription) {
        while let Some(message) = subscription.recv().await {
            let relay = self.clone();
            let span = info_span!("relay", topic = %message.topic, msg_id = %message.id);
            tokio::spawn(
                async move {
                    relay.relay(&message.payload).await;
                }
                .instrument(span),
            );
        }
        warn!(topic = subscription.topic(), "command subscription closed");
    }
}

fn target_device(text: &str) -> Result<String, GatewayError> {
    let stripped = text.replace(FRAME_DELIMITER_STR, "");
    let message = DeviceMessage::parse(&stripped)?;
    Ok(message.require(DEVICE_ID_FIELD)?.to_string())
}
