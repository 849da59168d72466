//! Publish/subscribe relay between the worker pool and the broadcaster.
//!
//! Workers publish photo records; exactly one [`RelayListener`] per process
//! subscribes and feeds the broadcaster. Delivery is at-most-once with no
//! ordering across publishers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  publish   ┌──────────────────────┐  subscribe  ┌───────────────┐
//! │  WorkerPool  │──────────▶│  Relay               │────────────▶│ RelayListener │
//! │  (N workers) │            │  MemoryRelay |       │  (exactly   │  (single)     │
//! └──────────────┘            │  SocketRelay → broker│   one)      └───────┬───────┘
//!                             └──────────────────────┘                     │
//!                                                                          ▼
//!                                                                   Broadcaster
//! ```
//!
//! Running a second subscription for the same viewer set duplicates every
//! message on screen. The listener holds a [`SubscriptionSlot`] so a process
//! can never run two.

mod backoff;
mod listener;
mod memory;
mod socket;

pub use backoff::RestartBackoff;
pub use listener::{RelayListener, RelayStatus, SubscriptionSlot};
pub use memory::MemoryRelay;
pub use socket::SocketRelay;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;

/// A payload in transit through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub channel: String,
    /// Serialized [`wall_core::PhotoRecord`]
    pub payload: String,
}

/// A live subscription. Dropping it unsubscribes.
pub struct RelaySubscription {
    channel: String,
    stream: BoxStream<'static, Result<RelayMessage, RelayError>>,
}

impl RelaySubscription {
    pub fn new(
        channel: impl Into<String>,
        stream: BoxStream<'static, Result<RelayMessage, RelayError>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            stream,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message. `None` means the subscription ended.
    pub async fn next(&mut self) -> Option<Result<RelayMessage, RelayError>> {
        self.stream.next().await
    }
}

impl std::fmt::Debug for RelaySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySubscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// A pub/sub backend.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Hands `payload` to the broker. Returns once the broker has accepted
    /// it, not once subscribers have it.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), RelayError>;

    /// Opens a subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription, RelayError>;

    /// Whether the last interaction with the broker succeeded.
    fn is_connected(&self) -> bool;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Relay failures. None of these are fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("a subscription to '{channel}' is already active in this process")]
    AlreadySubscribed { channel: String },

    #[error("relay protocol error: {0}")]
    Protocol(String),

    #[error("relay I/O error: {0}")]
    Io(String),

    #[error("relay connection closed")]
    Closed,

    #[error("relay listener panicked: {0}")]
    Panicked(String),
}
