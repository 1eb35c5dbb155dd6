//! Registry of live connections.
//!
//! Each accepted connection is recorded with its peer address, transport,
//! current protocol and activity timestamps. Entries are released by
//! [`ConnectionGuard`] when the owning session finishes, however it ends.

use crate::protocols::Protocol;
use crate::transport::Transport;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A single client connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub peer_addr: SocketAddr,
    pub transport: Transport,
    /// Protocol currently spoken; changes on upgrade.
    pub protocol: Protocol,
    pub created_at: Instant,
    pub last_activity: Instant,
    /// Requests served so far.
    pub requests: u64,
}

impl Connection {
    /// Create a new connection speaking HTTP/1.1.
    pub fn new(peer_addr: SocketAddr, transport: Transport) -> Self {
        let now = Instant::now();
        Self {
            peer_addr,
            transport,
            protocol: Protocol::Http1,
            created_at: now,
            last_activity: now,
            requests: 0,
        }
    }

    /// Record traffic on the connection.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last recorded traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.connections.iter()
    }
}

/// Thread-safe registry shared by acceptors and sessions.
pub struct Connections {
    registry: Mutex<ConnectionRegistry>,
}

impl Connections {
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(ConnectionRegistry::new(max_connections)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a connection. `None` means the server is full.
    pub fn register(self: &Arc<Self>, conn: Connection) -> Option<ConnectionGuard> {
        let id = self.lock().insert(conn)?;
        Some(ConnectionGuard {
            connections: Arc::clone(self),
            id,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// True once at least nine tenths of the connection slots are taken.
    pub fn under_pressure(&self) -> bool {
        let registry = self.lock();
        registry.len() * 10 >= registry.capacity() * 9
    }

    /// Copy of every live connection.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.lock().iter().map(|(_, conn)| conn.clone()).collect()
    }

    /// Wait until every connection has been released or `timeout` elapses.
    ///
    /// Returns how many connections were still open at the deadline.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let open = self.len();
            if open == 0 || tokio::time::Instant::now() >= deadline {
                return open;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Ownership of a registry entry; dropping it releases the slot.
pub struct ConnectionGuard {
    connections: Arc<Connections>,
    id: usize,
}

impl ConnectionGuard {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        if let Some(conn) = self.connections.lock().get_mut(self.id) {
            conn.protocol = protocol;
            conn.touch();
        }
    }

    pub fn touch(&self) {
        if let Some(conn) = self.connections.lock().get_mut(self.id) {
            conn.touch();
        }
    }

    /// Count a served request.
    pub fn record_request(&self) {
        if let Some(conn) = self.connections.lock().get_mut(self.id) {
            conn.requests += 1;
            conn.touch();
        }
    }

    /// Whether the server is close to its connection limit.
    pub fn server_under_pressure(&self) -> bool {
        self.connections.under_pressure()
    }

    pub fn info(&self) -> Option<Connection> {
        self.connections.lock().get(self.id).cloned()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.lock().remove(self.id);
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard").field("id", &self.id).finish()
    }
}
