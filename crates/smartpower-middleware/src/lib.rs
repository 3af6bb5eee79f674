//! `smartpower-middleware` – the message-bus seam.
//!
//! The gateway core never talks to a broker directly.  It publishes and
//! subscribes through the [`MessageBus`] trait, so the same session and relay
//! code runs against a real MQTT broker or an in-process bus.
//!
//! # Modules
//!
//! - [`bus`] – [`MessageBus`] trait, [`QoS`], [`BusMessage`],
//!   [`BusSubscription`] and the in-process [`EventBus`] built on Tokio
//!   broadcast channels.
//! - [`mqtt`] – [`MqttBus`], an adapter over `rumqttc` that drives the MQTT
//!   event loop and fans inbound publishes out to subscriptions.

pub mod bus;
pub mod mqtt;

pub use bus::{BusMessage, BusSubscription, EventBus, MessageBus, QoS, topic_matches};
pub use mqtt::{MqttBus, MqttConfig, MqttDriver};
