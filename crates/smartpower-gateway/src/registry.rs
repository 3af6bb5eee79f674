//! [`ConnectionRegistry`] – device identity → live connection.
//!
//! Sessions own their [`DeviceConnection`]; the registry only keeps a
//! [`ConnectionHandle`], which is a weak reference.  Once the owning session
//! ends, writes through a stale handle fail with
//! [`GatewayError::ClosedConnection`] instead of reaching a dead socket.
//!
//! Entries are never evicted.  A later frame carrying the same `DeviceID`
//! overwrites the previous entry (last writer wins), whichever connection it
//! arrived on.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use smartpower_types::GatewayError;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Write half of a device transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long [`DeviceConnection::close`] waits for an in-progress write
/// before leaving the shutdown to the last owner's drop.
pub const CLOSE_WAIT: Duration = Duration::from_millis(500);

// ────────────────────────────────────────────────────────────────────────────
// DeviceConnection
// ────────────────────────────────────────────────────────────────────────────

/// Writable side of one accepted transport connection.
///
/// All writes go through a per-connection async mutex, so a session's
/// responses and relayed commands never interleave on the wire.
pub struct DeviceConnection {
    id: Uuid,
    peer: String,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    write_timeout: Option<Duration>,
}

impl DeviceConnection {
    pub fn new(peer: impl Into<String>, writer: BoxedWriter) -> Arc<Self> {
        Self::with_write_timeout(peer, writer, None)
    }

    pub fn with_write_timeout(
        peer: impl Into<String>,
        writer: BoxedWriter,
        write_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            write_timeout,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Non-owning handle suitable for the registry.
    pub fn handle(self: &Arc<Self>) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            peer: self.peer.clone(),
            connection: Arc::downgrade(self),
        }
    }

    /// Write `bytes` in full and flush.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ClosedConnection`] after [`close`](Self::close);
    /// [`GatewayError::TransportWrite`] on I/O failure or write timeout.
    pub async fn write_all(&self, bytes: &[u8]) -> Result<(), GatewayError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .filter(|_| !self.is_closed())
            .ok_or_else(|| GatewayError::ClosedConnection(self.peer.clone()))?;

        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        let result = match self.write_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("write timed out after {} ms", limit.as_millis()),
                )),
            },
            None => write.await,
        };
        result.map_err(|e| GatewayError::TransportWrite {
            peer: self.peer.clone(),
            details: e.to_string(),
        })
    }

    /// Shut the writer down.  Idempotent.
    ///
    /// Later writes fail immediately.  A write already in progress holds the
    /// writer; `close` waits at most [`CLOSE_WAIT`] for it, after which the
    /// writer is released when the last reference to the connection drops.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = match tokio::time::timeout(CLOSE_WAIT, self.writer.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!(peer = %self.peer, "write in progress, close not waiting for it");
                return;
            }
        };
        if let Some(mut writer) = guard.take() {
            let shutdown = tokio::time::timeout(CLOSE_WAIT, writer.shutdown()).await;
            match shutdown {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "shutdown on close failed"),
                Err(_) => debug!(peer = %self.peer, "shutdown on close timed out"),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ConnectionHandle
// ────────────────────────────────────────────────────────────────────────────

/// Weak, clonable reference to a [`DeviceConnection`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    peer: String,
    connection: Weak<DeviceConnection>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// `true` once the owning session has dropped its connection.
    pub fn is_stale(&self) -> bool {
        self.connection.strong_count() == 0
    }

    /// Write through to the connection if it is still alive.
    pub async fn write_all(&self, bytes: &[u8]) -> Result<(), GatewayError> {
        let connection = self
            .connection
            .upgrade()
            .ok_or_else(|| GatewayError::ClosedConnection(self.peer.clone()))?;
        connection.write_all(bytes).await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ConnectionRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Process-wide map from `DeviceID` to [`ConnectionHandle`].
///
/// Safe to share between every session task and the command relay.  The
/// lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `device_id`, returning the previous
    /// handle if there was one.
    pub fn put(&self, device_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let conn_id = handle.id;
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string(), handle);
        if let Some(prev) = &previous {
            if prev.id != conn_id {
                debug!(device_id, old_conn = %prev.id, new_conn = %conn_id, "registry entry replaced");
            }
        }
        previous
    }

    /// Current handle for `device_id`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotFound`] when the device has never been seen.
    pub fn get(&self, device_id: &str) -> Result<ConnectionHandle, GatewayError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(device_id.to_string()))
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the registered device IDs, in no particular order.
    pub fn device_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
