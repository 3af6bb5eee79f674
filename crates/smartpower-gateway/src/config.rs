//! Tunables for the gateway core, deserialised from the `[gateway]` and
//! `[topics]` sections of the config file.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smartpower_middleware::QoS;

/// What a session does with the rest of a read when one frame fails to
/// decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodePolicy {
    /// Skip only the failing frame and keep processing the batch.
    #[default]
    SkipFrame,
    /// Discard every remaining frame of the current read (legacy behaviour).
    AbortBatch,
}

/// Bus topics used by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicTable {
    /// Destination for `Message: status` frames.
    pub status: String,
    /// Destination for `Message: systeminfo` frames.
    pub system_info: String,
    /// Destination for every other message type.
    pub fallback: String,
    /// Inbound topic carrying commands for devices.
    pub command: String,
}

impl Default for TopicTable {
    fn default() -> Self {
        Self {
            status: "/smartpower/status".to_string(),
            system_info: "/smartpower/systeminfo".to_string(),
            fallback: "/smartpower/settingres".to_string(),
            command: "/smartpower/command".to_string(),
        }
    }
}

/// Session and server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    /// Size of the per-read buffer.
    pub read_buffer_size: usize,
    /// Largest undelimited frame a session will buffer before giving up on
    /// the connection.
    pub max_frame_bytes: usize,
    pub decode_policy: DecodePolicy,
    /// Bound on a single publish, including the broker's acknowledgment.
    pub publish_timeout_ms: u64,
    /// `None` leaves device writes unbounded.
    pub write_timeout_ms: Option<u64>,
    pub publish_qos: QoS,
    pub publish_retain: bool,
    /// QoS of the command subscription.  Configured as `bus.command_qos`.
    #[serde(skip)]
    pub command_qos: QoS,
}

impl GatewayConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8860".to_string(),
            read_buffer_size: 1024,
            max_frame_bytes: 64 * 1024,
            decode_policy: DecodePolicy::default(),
            publish_timeout_ms: 5_000,
            write_timeout_ms: None,
            publish_qos: QoS::AtMostOnce,
            publish_retain: false,
            command_qos: QoS::AtMostOnce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_legacy_deployment() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8860");
        assert_eq!(cfg.read_buffer_size, 1024);
        assert_eq!(cfg.decode_policy, DecodePolicy::SkipFrame);
        assert_eq!(cfg.publish_timeout(), Duration::from_secs(5));
        assert!(cfg.write_timeout().is_none());

        let topics = TopicTable::default();
        assert_eq!(topics.command, "/smartpower/command");
        assert_eq!(topics.fallback, "/smartpower/settingres");
    }

    #[test]
    fn decode_policy_uses_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: DecodePolicy,
        }
        let w: Wrapper = serde_json::from_str(r#"{"policy":"abort-batch"}"#).unwrap();
        assert_eq!(w.policy, DecodePolicy::AbortBatch);
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let cfg: GatewayConfig = serde_json::from_str(r#"{"listen_addr":"127.0.0.1:9000"}"#).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.max_frame_bytes, 64 * 1024);

        let topics: TopicTable = serde_json::from_str(r#"{"status":"/s"}"#).unwrap();
        assert_eq!(topics.status, "/s");
        assert_eq!(topics.system_info, "/smartpower/systeminfo");
    }

    #[test]
    fn command_qos_is_not_read_from_gateway_section() {
        let cfg: GatewayConfig = serde_json::from_str(r#"{"command_qos":2}"#).unwrap();
        assert_eq!(cfg.command_qos, QoS::AtMostOnce);
    }
}
