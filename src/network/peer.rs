use crate::network::error::ProtocolResult;
use crate::network::wire;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a live connection.
///
/// The read half stays with the connection's handling task; the write half is shared so
/// that other tasks can relay frames into it.
pub struct Connection {
    address: SocketAddr,
    writer: tokio::sync::Mutex<BoxedWriter>,
}

impl Connection {
    pub fn new<W>(address: SocketAddr, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            address,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
        })
    }

    /// Remote address of this connection
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Write a complete frame. Concurrent senders never interleave their frames.
    pub async fn send_frame(&self, frame: &[u8], working: &CancellationToken) -> ProtocolResult<usize> {
        let mut writer = self.writer.lock().await;
        wire::write_all(&mut **writer, frame, working).await
    }

    /// Close the write side of the transport
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.address, e);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .finish()
    }
}

/// A registered peer
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub address: SocketAddr,
    pub name: String,
    pub connection: Arc<Connection>,
    pub registered_at: i64,
}

#[derive(Default)]
struct Indices {
    by_address: HashMap<SocketAddr, PeerEntry>,
    by_name: HashMap<String, SocketAddr>,
}

/// Peers known to an engine, indexed by remote address and by logical name.
///
/// Both indices sit behind one lock so they never disagree.
#[derive(Default)]
pub struct PeerDirectory {
    indices: Mutex<Indices>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `address` and `name` to `connection`.
    ///
    /// Returns false and changes nothing if either key is already bound; callers rebind
    /// by unregistering first.
    pub fn register(&self, address: SocketAddr, name: &str, connection: Arc<Connection>) -> bool {
        let mut indices = self.indices.lock();
        if indices.by_address.contains_key(&address) || indices.by_name.contains_key(name) {
            return false;
        }
        indices.by_name.insert(name.to_string(), address);
        indices.by_address.insert(
            address,
            PeerEntry {
                address,
                name: name.to_string(),
                connection,
                registered_at: chrono::Utc::now().timestamp(),
            },
        );
        info!("Peer {} registered at {}. Total peers: {}", name, address, indices.by_address.len());
        true
    }

    /// Unregister whatever holds `address` or `name`, then register the new binding.
    ///
    /// Returns the entries that were displaced.
    pub fn rebind(&self, address: SocketAddr, name: &str, connection: Arc<Connection>) -> Vec<PeerEntry> {
        let mut indices = self.indices.lock();
        let mut displaced = Vec::new();
        if let Some(entry) = indices.by_address.remove(&address) {
            indices.by_name.remove(&entry.name);
            displaced.push(entry);
        }
        if let Some(stale) = indices.by_name.remove(name) {
            if let Some(entry) = indices.by_address.remove(&stale) {
                displaced.push(entry);
            }
        }
        indices.by_name.insert(name.to_string(), address);
        indices.by_address.insert(
            address,
            PeerEntry {
                address,
                name: name.to_string(),
                connection,
                registered_at: chrono::Utc::now().timestamp(),
            },
        );
        for entry in &displaced {
            info!("Peer {} at {} displaced by {} at {}", entry.name, entry.address, name, address);
        }
        displaced
    }

    /// Remove the entry for `address`, returning its connection and name
    pub fn unregister(&self, address: SocketAddr) -> Option<(Arc<Connection>, String)> {
        let mut indices = self.indices.lock();
        let entry = indices.by_address.remove(&address)?;
        indices.by_name.remove(&entry.name);
        info!(
            "Peer {} at {} removed after {} s. Total peers: {}",
            entry.name,
            address,
            chrono::Utc::now().timestamp() - entry.registered_at,
            indices.by_address.len()
        );
        Some((entry.connection, entry.name))
    }

    pub fn lookup_by_address(&self, address: SocketAddr) -> Option<Arc<Connection>> {
        self.indices
            .lock()
            .by_address
            .get(&address)
            .map(|entry| Arc::clone(&entry.connection))
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<(SocketAddr, Arc<Connection>)> {
        let indices = self.indices.lock();
        let address = indices.by_name.get(name)?;
        indices
            .by_address
            .get(address)
            .map(|entry| (*address, Arc::clone(&entry.connection)))
    }

    /// Logical name registered for `address`
    pub fn name_of(&self, address: SocketAddr) -> Option<String> {
        self.indices
            .lock()
            .by_address
            .get(&address)
            .map(|entry| entry.name.clone())
    }

    pub fn contains_address(&self, address: SocketAddr) -> bool {
        self.indices.lock().by_address.contains_key(&address)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.indices.lock().by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.indices.lock().by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
