//! `smartpower-types` – shared vocabulary of the SmartPower gateway.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//!
//! - [`DeviceMessage`] – one decoded device frame (a flat string map).
//! - [`MessageKind`] – the classified intent of a frame's `Message` field.
//! - [`GatewayError`] – the single error type spanning transport, decode,
//!   bus, and registry failures.
//!
//! Frames on the wire are flat JSON objects separated by `**`:
//!
//! ```
//! use smartpower_types::{DeviceMessage, MessageKind};
//!
//! let msg = DeviceMessage::parse(r#"{"DeviceID":"AA:BB","Message":"status"}"#).unwrap();
//! assert_eq!(msg.device_id(), Some("AA:BB"));
//! assert_eq!(msg.kind(), MessageKind::Status);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field carrying the opaque device identity (usually a MAC address).
pub const DEVICE_ID_FIELD: &str = "DeviceID";
/// Field carrying the message type / intent.
pub const MESSAGE_FIELD: &str = "Message";
/// Field carrying the publish outcome in gateway responses.
pub const RESULT_FIELD: &str = "Result";

// ────────────────────────────────────────────────────────────────────────────
// DeviceMessage
// ────────────────────────────────────────────────────────────────────────────

/// One decoded device frame: a flat mapping from field name to string value.
///
/// Only [`DEVICE_ID_FIELD`] and [`MESSAGE_FIELD`] are interpreted by the
/// gateway; every other field is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceMessage {
    fields: BTreeMap<String, String>,
}

impl DeviceMessage {
    /// Decode `text` as a flat JSON object whose values are all strings.
    ///
    /// The raw [`serde_json::Error`] is returned so callers can tell an
    /// incomplete object ([`serde_json::Error::is_eof`]) from a malformed one.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Decode `text`, mapping any failure to [`GatewayError::FrameDecode`].
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        Self::from_json_str(text).map_err(|e| GatewayError::FrameDecode {
            raw: text.to_string(),
            reason: e.to_string(),
        })
    }

    /// Look up an arbitrary field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Set a field, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.fields.insert(key.into(), value.into())
    }

    /// The `DeviceID` field, if present.
    pub fn device_id(&self) -> Option<&str> {
        self.get(DEVICE_ID_FIELD)
    }

    /// The `Message` field, if present.
    pub fn message(&self) -> Option<&str> {
        self.get(MESSAGE_FIELD)
    }

    /// Classify the `Message` field. A missing field classifies as
    /// [`MessageKind::Other`] with an empty label.
    pub fn kind(&self) -> MessageKind {
        MessageKind::classify(self.message().unwrap_or_default())
    }

    /// Return the value of `key` or a [`GatewayError::FrameDecode`] naming
    /// the missing field.
    pub fn require(&self, key: &str) -> Result<&str, GatewayError> {
        self.get(key).ok_or_else(|| GatewayError::FrameDecode {
            raw: self.to_string(),
            reason: format!("missing required field `{key}`"),
        })
    }

    /// Iterate over all fields in key order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for DeviceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.fields) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.fields),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DeviceMessage {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MessageKind
// ────────────────────────────────────────────────────────────────────────────

/// Intent of a device frame, derived from its `Message` field.
///
/// Classification folds case and ignores whitespace, so `"status"`,
/// `"STATUS"`, `"SYSTEM INFO"` and `"systeminfo"` all land on a distinguished
/// variant.  Everything else is [`MessageKind::Other`] carrying the original
/// label verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Periodic device status report.
    Status,
    /// Static system information report.
    SystemInfo,
    /// Any other message type (setting responses, custom intents, …).
    Other(String),
}

impl MessageKind {
    pub fn classify(label: &str) -> Self {
        let folded: String = label
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        match folded.as_str() {
            "status" => MessageKind::Status,
            "systeminfo" => MessageKind::SystemInfo,
            _ => MessageKind::Other(label.to_string()),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// GatewayError
// ────────────────────────────────────────────────────────────────────────────

/// Global error type for the gateway.
///
/// Transport and decode errors are handled locally by the session that hit
/// them; bus errors surface to the device as `Result: "0"`.  Nothing here is
/// retried automatically.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("transport read error from {peer}: {source}")]
    TransportRead {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport write error to {peer}: {details}")]
    TransportWrite { peer: String, details: String },

    #[error("transport accept error: {0}")]
    TransportAccept(String),

    #[error("cannot listen on {addr}: {details}")]
    TransportBind { addr: String, details: String },

    #[error("frame decode error: {reason} (raw: {raw:?})")]
    FrameDecode { raw: String, reason: String },

    #[error("frame exceeds {limit} bytes without a delimiter")]
    FrameTooLarge { limit: usize },

    #[error("response encode error: {0}")]
    Encode(String),

    #[error("bus publish to {topic} failed: {details}")]
    BusPublish { topic: String, details: String },

    #[error("bus subscribe to {topic} failed: {details}")]
    BusSubscribe { topic: String, details: String },

    #[error("bus connect error: {0}")]
    BusConnect(String),

    #[error("no connection registered for device {0}")]
    NotFound(String),

    #[error("connection {0} is closed")]
    ClosedConnection(String),

    #[error("configuration error: {0}")]
    Config(String),
}
