//! A registered viewer and the transport it writes through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use wall_core::{ConnectionId, ConnectionState, DomainResult, PoolId, StateEvent};

/// Why a single send did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Connection is no longer open
    #[error("connection closed")]
    Closed,

    #[error("send timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Write side of a viewer connection.
///
/// Implementations serialize their own writes; `send_text` may be called
/// concurrently from the broadcaster and the connection's read loop.
#[async_trait]
pub trait ViewerTransport: Send + Sync + 'static {
    async fn send_text(&self, frame: Arc<str>) -> Result<(), SendError>;

    /// Best-effort close. Errors are ignored.
    async fn close(&self);
}

/// A viewer as seen by the registry and broadcaster.
pub struct Connection {
    id: ConnectionId,
    pool_id: PoolId,
    transport: Arc<dyn ViewerTransport>,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    state: Mutex<ConnectionState>,
    removed: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnectionId, pool_id: PoolId, transport: Arc<dyn ViewerTransport>) -> Self {
        Self {
            id,
            pool_id,
            transport,
            connected_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            state: Mutex::new(ConnectionState::Connecting),
            removed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Applies a lifecycle event atomically.
    pub fn apply(&self, event: StateEvent) -> DomainResult<ConnectionState> {
        let mut state = self.state.lock();
        let next = state.transition(self.id, event)?;
        *state = next;
        Ok(next)
    }

    /// Records inbound traffic.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Sends one frame, bounded by `limit`.
    pub async fn send(&self, frame: Arc<str>, limit: Duration) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        match tokio::time::timeout(limit, self.transport.send_text(frame)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout { after: limit }),
        }
    }

    pub async fn close_transport(&self) {
        self.transport.close().await;
    }

    /// Cancelled once the registry has removed this connection.
    pub fn removed_token(&self) -> CancellationToken {
        self.removed.clone()
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("state", &self.state())
            .finish()
    }
}
