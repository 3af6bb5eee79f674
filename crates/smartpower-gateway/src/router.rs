//! [`MessageRouter`] – picks the bus topic for a device frame.
//!
//! | `Message` (case-folded, whitespace removed) | Topic |
//! |---|---|
//! | `status` | [`TopicTable::status`] |
//! | `systeminfo` | [`TopicTable::system_info`] |
//! | anything else | [`TopicTable::fallback`] |

use smartpower_types::{DeviceMessage, MessageKind};

use crate::config::TopicTable;

/// Pure, total mapping from message type to topic.
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    topics: TopicTable,
}

impl MessageRouter {
    pub fn new(topics: TopicTable) -> Self {
        Self { topics }
    }

    /// Topic for `message`.  Never fails: unknown or missing types go to the
    /// fallback topic.
    pub fn topic_for(&self, message: &DeviceMessage) -> &str {
        self.topic_for_kind(&message.kind())
    }

    pub fn topic_for_kind(&self, kind: &MessageKind) -> &str {
        match kind {
            MessageKind::Status => &self.topics.status,
            MessageKind::SystemInfo => &self.topics.system_info,
            MessageKind::Other(_) => &self.topics.fallback,
        }
    }

    /// Inbound topic carrying commands for devices.
    pub fn command_topic(&self) -> &str {
        &self.topics.command
    }

    pub fn topics(&self) -> &TopicTable {
        &self.topics
    }
}
