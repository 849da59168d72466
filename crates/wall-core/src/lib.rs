//! photowall core - shared domain types
//!
//! This crate provides the domain types shared between the daemon
//! (walld), the relay broker and the wire protocol.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod connection;
pub mod error;
pub mod submission;

// Re-exports for convenience
pub use connection::{ConnectionId, ConnectionState, PoolId, StateEvent};
pub use error::{DomainError, DomainResult};
pub use submission::{PhotoRecord, Submission, SubmissionId};
