//! Viewer connection identity and lifecycle.
//!
//! ```text
//! Connecting ──handshake──▶ Open ──disconnect──▶ Closing ──┐
//!      │                     │                            ├──unregister──▶ Removed
//!      └──────failure────────┴───────failure────▶ Failed ──┘
//! ```
//!
//! `Removed` is terminal: a removed connection is never reused.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Unique identifier of a viewer connection.
///
/// Allocated from a process-wide monotonic counter, so ids are never
/// reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Index of a connection pool, `0..pool_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(usize);

impl PoolId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> usize {
        self.0
    }

    /// Parses a pool id from a route segment, bounded by `pool_count`.
    pub fn parse(raw: &str, pool_count: usize) -> DomainResult<Self> {
        let index: usize = raw.parse().map_err(|_| DomainError::ParseError {
            field: "pool_id".to_string(),
            reason: format!("'{raw}' is not a non-negative integer"),
        })?;

        if index >= pool_count {
            return Err(DomainError::InvalidFieldValue {
                field: "pool_id".to_string(),
                value: index.to_string(),
                expected: format!("0..{pool_count}"),
            });
        }

        Ok(Self(index))
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a viewer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Failed,
    Removed,
}

/// Something that happened to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEvent {
    /// Handshake completed; the connection is about to be registered
    Handshake,
    /// Client asked to disconnect (close frame, EOF)
    Disconnect,
    /// A send failed or the liveness window expired
    Failure,
    /// The registry dropped the connection
    Unregister,
}

impl ConnectionState {
    /// Returns the state reached by applying `event`, if the lifecycle allows it.
    ///
    /// A failure reported while already leaving (`Closing`/`Failed`) keeps
    /// the current state, since several delivery tasks may observe the same
    /// dead socket.
    pub fn next(self, event: StateEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use StateEvent::*;

        match (self, event) {
            (Connecting, Handshake) => Some(Open),
            (Connecting, Failure) => Some(Failed),
            (Open, Disconnect) => Some(Closing),
            (Open, Failure) => Some(Failed),
            (Closing, Failure) | (Closing, Disconnect) => Some(Closing),
            (Failed, Failure) | (Failed, Disconnect) => Some(Failed),
            (Closing, Unregister) | (Failed, Unregister) => Some(Removed),
            _ => None,
        }
    }

    /// Like [`next`](Self::next) but reports a typed error for `connection_id`.
    pub fn transition(self, connection_id: ConnectionId, event: StateEvent) -> DomainResult<Self> {
        self.next(event).ok_or(DomainError::InvalidTransition {
            connection_id,
            from: self,
            event,
        })
    }

    /// Whether the connection may still receive broadcasts.
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }

    /// Whether the connection has reached its terminal state.
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let id = ConnectionId::new(1);
        let state = ConnectionState::Connecting
            .transition(id, StateEvent::Handshake)
            .unwrap();
        assert_eq!(state, ConnectionState::Open);

        let state = state.transition(id, StateEvent::Disconnect).unwrap();
        assert_eq!(state, ConnectionState::Closing);

        let state = state.transition(id, StateEvent::Unregister).unwrap();
        assert_eq!(state, ConnectionState::Removed);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_failure_path() {
        let state = ConnectionState::Open.next(StateEvent::Failure);
        assert_eq!(state, Some(ConnectionState::Failed));
        assert_eq!(
            ConnectionState::Failed.next(StateEvent::Unregister),
            Some(ConnectionState::Removed)
        );
    }

    #[test]
    fn test_removed_is_terminal() {
        for event in [
            StateEvent::Handshake,
            StateEvent::Disconnect,
            StateEvent::Failure,
            StateEvent::Unregister,
        ] {
            assert_eq!(ConnectionState::Removed.next(event), None);
        }
    }

    #[test]
    fn test_open_cannot_skip_to_removed() {
        let err = ConnectionState::Open
            .transition(ConnectionId::new(7), StateEvent::Unregister)
            .unwrap_err();
        assert!(err.to_string().contains("conn-7"));
    }

    #[test]
    fn test_repeated_failure_is_absorbed() {
        assert_eq!(
            ConnectionState::Failed.next(StateEvent::Failure),
            Some(ConnectionState::Failed)
        );
        assert_eq!(
            ConnectionState::Closing.next(StateEvent::Failure),
            Some(ConnectionState::Closing)
        );
    }

    #[test]
    fn test_pool_id_parse() {
        assert_eq!(PoolId::parse("2", 4).unwrap(), PoolId::new(2));
        assert!(PoolId::parse("4", 4).is_err());
        assert!(PoolId::parse("-1", 4).is_err());
        assert!(PoolId::parse("abc", 4).is_err());
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "conn-42");
    }
}
