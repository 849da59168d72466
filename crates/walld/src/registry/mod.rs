//! Connection registry partitioned into pools.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────── index: DashMap<ConnectionId, PoolId> ────────────┐
//!                │                                                              │
//!   register ──▶ ┌─────────┐  ┌─────────┐        ┌─────────┐ ◀── unregister
//!                │ pool 0  │  │ pool 1  │  ...   │ pool P-1│
//!                │ Mutex<  │  │ Mutex<  │        │ Mutex<  │
//!                │ HashMap>│  │ HashMap>│        │ HashMap>│
//!                └─────────┘  └─────────┘        └─────────┘
//!                       ╲           │            ╱
//!                        ───── snapshot() ──────   (one pool lock at a time)
//! ```
//!
//! Each pool has its own lock, so registrations in different pools never
//! contend. The index records which pool a connection lives in and is only
//! written while that pool's lock is held, so a connection is in at most one
//! pool and the index always agrees with the pools.
//!
//! A snapshot copies `Arc`s pool by pool. It reflects every registration
//! that completed before it started; one racing with it may or may not
//! appear. Senders never hold a registry lock.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Unknown pools and repeated removals are reported, not asserted

mod connection;

pub use connection::{Connection, SendError, ViewerTransport};

#[cfg(test)]
pub(crate) use connection::test_support;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use wall_core::{ConnectionId, ConnectionState, PoolId, StateEvent};

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Viewer closed the socket or sent a close frame
    Disconnected,

    /// A broadcast send failed or timed out
    SendFailed,

    /// Reading from the viewer failed
    ReadFailed,

    /// No inbound traffic within the liveness window
    LivenessExpired,

    /// Process is shutting down
    Shutdown,
}

impl RemovalReason {
    /// The lifecycle event this removal implies.
    fn event(self) -> StateEvent {
        match self {
            Self::Disconnected | Self::Shutdown => StateEvent::Disconnect,
            Self::SendFailed | Self::ReadFailed | Self::LivenessExpired => StateEvent::Failure,
        }
    }
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "viewer disconnected"),
            Self::SendFailed => write!(f, "send failed"),
            Self::ReadFailed => write!(f, "read failed"),
            Self::LivenessExpired => write!(f, "liveness window expired"),
            Self::Shutdown => write!(f, "server shutting down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("pool {pool} does not exist (pools: {pool_count})")]
    UnknownPool { pool: PoolId, pool_count: usize },

    /// Removed connections are never registered again
    #[error("connection {0} was already removed")]
    ConnectionRemoved(ConnectionId),

    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
}

/// Per-pool connection counts for the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool_id: PoolId,
    pub connections: usize,
}

#[derive(Default)]
struct Pool {
    connections: HashMap<ConnectionId, Arc<Connection>>,
}

pub struct ConnectionRegistry {
    pools: Vec<Mutex<Pool>>,
    index: DashMap<ConnectionId, PoolId>,
    next_id: AtomicU64,
    next_pool: AtomicUsize,
}

impl ConnectionRegistry {
    /// Creates `pool_count` empty pools. The pool table is fixed from here on.
    pub fn new(pool_count: usize) -> Self {
        let pool_count = pool_count.max(1);
        Self {
            pools: (0..pool_count).map(|_| Mutex::new(Pool::default())).collect(),
            index: DashMap::new(),
            next_id: AtomicU64::new(1),
            next_pool: AtomicUsize::new(0),
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool_ids(&self) -> impl Iterator<Item = PoolId> {
        (0..self.pools.len()).map(PoolId::new)
    }

    /// Allocates an id that has never been handed out in this process.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Round-robin pool choice for viewers that did not name one.
    pub fn assign_pool(&self) -> PoolId {
        let n = self.next_pool.fetch_add(1, Ordering::Relaxed);
        PoolId::new(n % self.pools.len())
    }

    /// Adds an open connection to its pool.
    ///
    /// Moves the connection from `Connecting` to `Open`. Fails for an unknown
    /// pool, a connection that is already registered, or one that has
    /// already left the registry.
    pub fn register(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let id = conn.id();
        let pool_id = conn.pool_id();
        let pool = self.pools.get(pool_id.index()).ok_or(RegistryError::UnknownPool {
            pool: pool_id,
            pool_count: self.pools.len(),
        })?;

        let mut guard = pool.lock();
        if self.index.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        conn.apply(StateEvent::Handshake)
            .map_err(|_| match conn.state() {
                ConnectionState::Open => RegistryError::AlreadyRegistered(id),
                _ => RegistryError::ConnectionRemoved(id),
            })?;

        guard.connections.insert(id, conn);
        self.index.insert(id, pool_id);
        let pool_size = guard.connections.len();
        drop(guard);

        debug!(connection = %id, pool = %pool_id, pool_size, "Connection registered");
        Ok(())
    }

    /// Removes a connection and moves it to `Removed`.
    ///
    /// Idempotent: returns `None` if the connection is not registered, which
    /// is expected when a broadcast failure and a disconnect race.
    pub fn unregister(&self, id: ConnectionId, reason: RemovalReason) -> Option<Arc<Connection>> {
        // Copy out before locking the pool; never hold a shard guard across it.
        let pool_id = self.index.get(&id).map(|entry| *entry.value())?;
        let pool = self.pools.get(pool_id.index())?;

        let conn = {
            let mut guard = pool.lock();
            // Lost a race with another unregister.
            self.index.remove(&id)?;
            guard.connections.remove(&id)
        }?;

        // Open connections go through Closing/Failed first; the rest are
        // already on their way out.
        if let Err(e) = conn.apply(reason.event()) {
            warn!(connection = %id, error = %e, "Unexpected state on removal");
        }
        if let Err(e) = conn.apply(StateEvent::Unregister) {
            warn!(connection = %id, error = %e, "Unexpected state on removal");
        }
        conn.mark_removed();

        info!(connection = %id, pool = %pool_id, %reason, "Connection removed");
        Some(conn)
    }

    /// Copies the current connections pool by pool. No lock is held once
    /// this returns.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut out = Vec::with_capacity(self.index.len());
        for pool in &self.pools {
            out.extend(pool.lock().connections.values().cloned());
        }
        out
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let pool_id = self.index.get(&id).map(|entry| *entry.value())?;
        self.pools
            .get(pool_id.index())?
            .lock()
            .connections
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools
            .iter()
            .enumerate()
            .map(|(index, pool)| PoolStats {
                pool_id: PoolId::new(index),
                connections: pool.lock().connections.len(),
            })
            .collect()
    }

    /// Removes every connection, returning them so callers can close transports.
    pub fn drain(&self, reason: RemovalReason) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter_map(|conn| self.unregister(conn.id(), reason))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingTransport;
    use super::*;

    fn new_conn(registry: &ConnectionRegistry, pool: usize) -> Arc<Connection> {
        Arc::new(Connection::new(
            registry.next_connection_id(),
            PoolId::new(pool),
            Arc::new(RecordingTransport::default()),
        ))
    }

    #[test]
    fn test_register_opens_and_indexes() {
        let registry = ConnectionRegistry::new(4);
        let conn = new_conn(&registry, 2);

        registry.register(Arc::clone(&conn)).unwrap();

        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(registry.contains(conn.id()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pool_stats()[2].connections, 1);
    }

    #[test]
    fn test_unknown_pool_rejected() {
        let registry = ConnectionRegistry::new(2);
        let conn = new_conn(&registry, 5);

        let err = registry.register(conn).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPool { pool_count: 2, .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_double_register_rejected() {
        let registry = ConnectionRegistry::new(1);
        let conn = new_conn(&registry, 0);

        registry.register(Arc::clone(&conn)).unwrap();
        assert_eq!(
            registry.register(Arc::clone(&conn)),
            Err(RegistryError::AlreadyRegistered(conn.id()))
        );
    }

    #[test]
    fn test_unregister_is_idempotent_and_terminal() {
        let registry = ConnectionRegistry::new(2);
        let conn = new_conn(&registry, 1);
        registry.register(Arc::clone(&conn)).unwrap();

        assert!(registry.unregister(conn.id(), RemovalReason::Disconnected).is_some());
        assert!(registry.unregister(conn.id(), RemovalReason::SendFailed).is_none());
        assert_eq!(conn.state(), ConnectionState::Removed);
        assert!(conn.removed_token().is_cancelled());

        assert_eq!(
            registry.register(Arc::clone(&conn)),
            Err(RegistryError::ConnectionRemoved(conn.id()))
        );
    }

    #[test]
    fn test_ids_are_never_reused() {
        let registry = ConnectionRegistry::new(1);
        let a = registry.next_connection_id();
        let b = registry.next_connection_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_round_robin_assignment() {
        let registry = ConnectionRegistry::new(3);
        let pools: Vec<_> = (0..6).map(|_| registry.assign_pool().index()).collect();
        assert_eq!(pools, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_snapshot_covers_all_pools() {
        let registry = ConnectionRegistry::new(3);
        for pool in [0, 1, 2, 2] {
            registry.register(new_conn(&registry, pool)).unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 4);

        // Removing after the snapshot does not change it.
        registry.unregister(snapshot[0].id(), RemovalReason::Disconnected);
        assert_eq!(snapshot.len(), 4);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_drain_removes_everything() {
        let registry = ConnectionRegistry::new(2);
        for pool in [0, 1, 1] {
            registry.register(new_conn(&registry, pool)).unwrap();
        }

        let drained = registry.drain(RemovalReason::Shutdown);
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty());
        assert!(drained.iter().all(|c| c.state() == ConnectionState::Removed));
    }

    #[test]
    fn test_concurrent_register_unregister_keeps_index_consistent() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let conn = new_conn(&registry, (t + i) % 4);
                        registry.register(Arc::clone(&conn)).unwrap();
                        if i % 2 == 0 {
                            registry.unregister(conn.id(), RemovalReason::Disconnected);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total: usize = registry.pool_stats().iter().map(|p| p.connections).sum();
        assert_eq!(total, registry.len());
        assert_eq!(total, 8 * 100);
    }
}
