//! [`GatewayServer`] – TCP accept loop for device connections.
//!
//! Listens on `0.0.0.0:8860` by default (see [`GatewayConfig::listen_addr`]).
//! Every accepted stream is split into read and write halves and handed to
//! its own [`Session`] task; a failing session never affects the listener.
//!
//! [`GatewayConfig::listen_addr`]: crate::config::GatewayConfig::listen_addr

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use smartpower_types::GatewayError;
use tokio::net::TcpListener;
use tracing::{Instrument, error, info, info_span};

use crate::gateway::Gateway;
use crate::session::Session;

// ---------------------------------------------------------------------------
// GatewayServer
// ---------------------------------------------------------------------------

/// Accepts device connections and spawns a session per connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use smartpower_gateway::config::{GatewayConfig, TopicTable};
/// use smartpower_gateway::{Gateway, GatewayServer};
/// use smartpower_middleware::EventBus;
///
/// #[tokio::main]
/// async fn main() -> Result<(), smartpower_types::GatewayError> {
///     let bus = Arc::new(EventBus::default());
///     let gateway = Arc::new(Gateway::new(bus, GatewayConfig::default(), TopicTable::default()));
///     GatewayServer::new(gateway).run().await
/// }
/// ```
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    addr: String,
}

impl GatewayServer {
    /// Create a server for `gateway` on its configured listen address.
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let addr = gateway.config().listen_addr.clone();
        Self { gateway, addr }
    }

    /// Override the listen address (builder-style).
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// [`GatewayError::TransportBind`] when the address is unusable or taken.
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        TcpListener::bind(&self.addr)
            .await
            .map_err(|e| GatewayError::TransportBind {
                addr: self.addr.clone(),
                details: e.to_string(),
            })
    }

    /// Bind and serve forever.
    pub async fn run(self) -> Result<(), GatewayError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve an already-bound listener until `shutdown` resolves.
    ///
    /// Sessions still running at shutdown are left to finish on their own
    /// tasks.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send,
    {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.addr.clone());
        info!(addr = %local, "gateway listening for devices");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %local, "gateway listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => {
                        let e = GatewayError::TransportAccept(e.to_string());
                        error!(error = %e, "accept failed");
                    }
                },
            }
        }
    }

    fn spawn_session(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();
        let session = Session::new(reader, Box::new(writer), peer.to_string(), Arc::clone(&self.gateway));
        // Session::run logs its own termination reason.
        tokio::spawn(
            async move {
                let _ = session.run().await;
            }
            .instrument(info_span!("session", peer = %peer)),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, TopicTable};
    use crate::testing::RecordingBus;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    const STATUS: &str = r#"{"DeviceID":"AA:BB","Message":"status"}"#;
    const ACK: &str = r#"{"Message":"RESP STATUS","DeviceID":"AA:BB","Result":"1"}"#;

    fn gateway(bus: Arc<RecordingBus>) -> Arc<Gateway> {
        Arc::new(Gateway::new(bus, GatewayConfig::default(), TopicTable::default()))
    }

    async fn start(
        gateway: Arc<Gateway>,
    ) -> Result<(SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<Result<(), GatewayError>>), GatewayError>
    {
        let server = GatewayServer::new(gateway).with_addr("127.0.0.1:0");
        let listener = server.bind().await?;
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::TransportAccept(e.to_string()))?;
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(listener, async move {
            let _ = rx.await;
        }));
        Ok((addr, tx, task))
    }

    async fn read_ack(stream: &mut TcpStream, len: usize) -> Result<String, Box<dyn std::error::Error>> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await??;
        Ok(String::from_utf8(buf)?)
    }

    #[test]
    fn default_addr_comes_from_config() {
        let server = GatewayServer::new(gateway(Arc::new(RecordingBus::default())));
        assert_eq!(server.addr(), "0.0.0.0:8860");
        assert_eq!(server.with_addr("127.0.0.1:9000").addr(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let server =
            GatewayServer::new(gateway(Arc::new(RecordingBus::default()))).with_addr("not-an-address");
        assert!(matches!(server.bind().await, Err(GatewayError::TransportBind { .. })));
    }

    #[tokio::test]
    async fn status_frame_over_tcp_is_published_and_acked() -> Result<(), Box<dyn std::error::Error>> {
        let bus = Arc::new(RecordingBus::default());
        let (addr, stop, task) = start(gateway(bus.clone())).await?;

        let mut device = TcpStream::connect(addr).await?;
        device.write_all(format!("**{STATUS}**").as_bytes()).await?;
        assert_eq!(read_ack(&mut device, ACK.len()).await?, ACK);
        assert_eq!(
            bus.published(),
            vec![("/smartpower/status".to_string(), STATUS.to_string())]
        );

        let _ = stop.send(());
        task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn command_reaches_device_registered_over_tcp() -> Result<(), Box<dyn std::error::Error>> {
        let bus = Arc::new(RecordingBus::default());
        let gw = gateway(bus.clone());
        let relay = gw.spawn_relay().await?;
        let (addr, stop, task) = start(Arc::clone(&gw)).await?;

        let mut device = TcpStream::connect(addr).await?;
        device.write_all(STATUS.as_bytes()).await?;
        read_ack(&mut device, ACK.len()).await?;

        let command = r#"**{"DeviceID":"AA:BB","Message":"SETTING","Relay":"on"}**"#;
        bus.inner.publish_to("/smartpower/command", command.as_bytes())?;
        assert_eq!(read_ack(&mut device, command.len()).await?, command);

        let _ = stop.send(());
        task.await??;
        relay.abort();
        Ok(())
    }

    #[tokio::test]
    async fn one_bad_session_does_not_stop_the_listener() -> Result<(), Box<dyn std::error::Error>> {
        let bus = Arc::new(RecordingBus::default());
        let (addr, stop, task) = start(gateway(bus)).await?;

        let mut first = TcpStream::connect(addr).await?;
        first.write_all(b"garbage**").await?;
        drop(first);

        let mut second = TcpStream::connect(addr).await?;
        second.write_all(STATUS.as_bytes()).await?;
        assert_eq!(read_ack(&mut second, ACK.len()).await?, ACK);

        let _ = stop.send(());
        task.await??;
        Ok(())
    }
}
