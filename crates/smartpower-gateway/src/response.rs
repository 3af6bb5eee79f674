//! Synchronous acknowledgment written back to a device after each frame.
//!
//! ```text
//! {"Message":"RESP STATUS","DeviceID":"AA:BB","Result":"1"}
//! ```
//!
//! `Result` is the only success signal a device gets; it cannot tell a
//! broker outage from any other publish failure.

use serde::{Deserialize, Serialize};
use smartpower_types::{DeviceMessage, GatewayError, MessageKind};

pub const RESULT_OK: &str = "1";
pub const RESULT_FAILED: &str = "0";

/// Response object as it appears on the device wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "Result")]
    pub result: String,
}

impl Response {
    pub fn succeeded(&self) -> bool {
        self.result == RESULT_OK
    }

    /// Compact JSON bytes, ready to write.
    pub fn to_wire(&self) -> Result<Vec<u8>, GatewayError> {
        serde_json::to_vec(self).map_err(|e| GatewayError::Encode(e.to_string()))
    }
}

/// Build the acknowledgment for `message`.
///
/// Status and system-info frames get a `RESP …` label; every other type is
/// echoed verbatim.
pub fn synthesize(message: &DeviceMessage, published: bool) -> Response {
    let label = match message.kind() {
        MessageKind::Status => "RESP STATUS".to_string(),
        MessageKind::SystemInfo => "RESP SYSTEM INFO".to_string(),
        MessageKind::Other(original) => original,
    };
    Response {
        message: label,
        device_id: message.device_id().unwrap_or_default().to_string(),
        result: (if published { RESULT_OK } else { RESULT_FAILED }).to_string(),
    }
}
