//! Domain-specific error types following panic-free policy.

use crate::{ConnectionId, ConnectionState, StateEvent};
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A connection state change that the lifecycle does not allow
    #[error("Invalid transition for {connection_id}: {from:?} on {event:?}")]
    InvalidTransition {
        connection_id: ConnectionId,
        from: ConnectionState,
        event: StateEvent,
    },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
