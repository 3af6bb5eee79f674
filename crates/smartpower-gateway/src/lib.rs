//! `smartpower-gateway` – TCP ↔ message-bus bridge for SmartPower devices.
//!
//! Devices keep a long-lived TCP connection open and stream `**`-delimited
//! JSON frames.  For every frame the gateway:
//!
//! 1. **Registers** the frame's `DeviceID` against the connection it arrived
//!    on, so commands can find their way back.
//! 2. **Publishes** the frame on a topic chosen from its `Message` type
//!    (`status`, `systeminfo`, or the settings fallback).
//! 3. **Acknowledges** the frame on the same connection with a
//!    `{"Message","DeviceID","Result"}` response.
//!
//! In the other direction the [`CommandRelay`] subscribes to the command
//! topic and writes each command, byte for byte, to the connection of the
//! device it names.
//!
//! # Modules
//!
//! - [`codec`] – frame splitting and decoding.
//! - [`config`] – [`GatewayConfig`], [`TopicTable`], [`DecodePolicy`].
//! - [`gateway`] – shared state and per-frame processing.
//! - [`registry`] – device ID → connection map.
//! - [`relay`] – bus → device command path.
//! - [`response`] – acknowledgment synthesis.
//! - [`router`] – message type → topic.
//! - [`server`] – TCP accept loop.
//! - [`session`] – per-connection read loop.
//! - [`telemetry`] – tracing subscriber and OTLP export.

pub mod codec;
pub mod config;
pub mod gateway;
pub mod registry;
pub mod relay;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use codec::{Frame, FrameDecoder, Frames};
pub use config::{DecodePolicy, GatewayConfig, TopicTable};
pub use gateway::Gateway;
pub use registry::{ConnectionHandle, ConnectionRegistry, DeviceConnection};
pub use relay::{CommandRelay, RelayOutcome};
pub use response::{Response, synthesize};
pub use router::MessageRouter;
pub use server::GatewayServer;
pub use session::{Session, SessionState};
