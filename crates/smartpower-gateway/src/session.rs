//! [`Session`] – drives one accepted device connection.
//!
//! ```text
//!  Open ──▶ Reading ──(EOF │ read error │ write error │ frame overflow)──▶ Closed
//!            ▲    │
//!            └────┘ read chunk → decode → per frame: register, publish, ack
//! ```
//!
//! Frames from one read are processed strictly in delimiter order, and each
//! acknowledgment is written before the next frame is looked at.  The
//! connection is closed exactly once, on every exit path.

use std::sync::Arc;

use smartpower_types::GatewayError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};

use crate::codec::{FrameDecoder, Frames};
use crate::config::DecodePolicy;
use crate::gateway::Gateway;
use crate::registry::{BoxedWriter, DeviceConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Reading,
    Closed,
}

/// Per-connection processing loop.
pub struct Session<R> {
    reader: R,
    connection: Arc<DeviceConnection>,
    decoder: FrameDecoder,
    gateway: Arc<Gateway>,
    read_buffer_size: usize,
    state: SessionState,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, writer: BoxedWriter, peer: impl Into<String>, gateway: Arc<Gateway>) -> Self {
        let config = gateway.config();
        let connection = DeviceConnection::with_write_timeout(peer, writer, config.write_timeout());
        let decoder = FrameDecoder::new(config.max_frame_bytes);
        let read_buffer_size = config.read_buffer_size.max(1);
        Self {
            reader,
            connection,
            decoder,
            gateway,
            read_buffer_size,
            state: SessionState::Open,
        }
    }

    pub fn connection(&self) -> &Arc<DeviceConnection> {
        &self.connection
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run until the connection ends, then close it.
    ///
    /// A clean end of stream returns `Ok(())`.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        let peer = self.connection.peer().to_string();
        info!(peer = %peer, conn_id = %self.connection.id(), "accepted connection");

        let result = self.read_loop().await;
        self.connection.close().await;
        self.state = SessionState::Closed;

        match &result {
            Ok(()) => info!(peer = %peer, "connection closed by remote host"),
            Err(e) => warn!(peer = %peer, error = %e, "session terminated"),
        }
        result
    }

    async fn read_loop(&mut self) -> Result<(), GatewayError> {
        self.state = SessionState::Reading;
        let mut buf = vec![0u8; self.read_buffer_size];
        loop {
            let n = self
                .reader
                .read(&mut buf)
                .await
                .map_err(|source| GatewayError::TransportRead {
                    peer: self.connection.peer().to_string(),
                    source,
                })?;

            if n == 0 {
                let frames = self.decoder.finish();
                return self.process(frames).await;
            }

            let frames = self.decoder.push(&buf[..n]);
            let overflow = frames.overflow();
            self.process(frames).await?;
            if let Some(limit) = overflow {
                return Err(GatewayError::FrameTooLarge { limit });
            }
        }
    }

    /// Handle every frame of one read.  Decode failures are logged and, per
    /// [`DecodePolicy`], either skipped or end the batch; they never end the
    /// session.
    async fn process(&mut self, frames: Frames) -> Result<(), GatewayError> {
        let policy = self.gateway.config().decode_policy;
        for item in frames {
            match item {
                Ok(frame) => {
                    self.gateway.handle_frame(&self.connection, frame).await?;
                }
                Err(e) => {
                    warn!(peer = self.connection.peer(), error = %e, "received data decode error");
                    if policy == DecodePolicy::AbortBatch {
                        warn!(peer = self.connection.peer(), "discarding rest of batch");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
