//! Standalone relay broker (`walld broker`).
//!
//! Lets several `walld` processes share one photo channel: each publishes
//! through the broker and each holds one subscription to it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   BrokerServer   │
//! │   UnixListener   │
//! └────────┬─────────┘
//!          │ accept()
//!          ▼
//! ┌──────────────────┐  Publish   ┌──────────────────────────────┐
//! │ BrokerConnection │──────────▶│ ChannelMap                    │
//! │   (per client)   │            │ channel → {conn → queue}      │
//! └──────────────────┘            └──────────────┬───────────────┘
//!                                                │ try_send
//!                                                ▼
//!                                   per-client outbound queue
//!                                                │ writer task
//!                                                ▼
//!                                        subscribed clients
//! ```
//!
//! A `Publish` is acked once the frame is on every subscriber's outbound
//! queue; it never waits on a subscriber's socket. Delivery is
//! at-most-once: a subscriber whose queue is full misses that message, and
//! one whose writer failed or timed out is dropped from every channel.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{BrokerConnection, ConnectionError, SubscriberQueue, OUTBOUND_BUFFER};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wall_protocol::{encode_frame, BrokerMessage};

use crate::config::DEFAULT_BROKER_SOCKET;

/// Connection number → outbound queue, for one channel.
pub type ChannelSubscribers = HashMap<u64, SubscriberQueue>;

/// Channel name → subscribers.
pub type ChannelMap = Arc<RwLock<HashMap<String, ChannelSubscribers>>>;

/// Unix socket relay broker.
pub struct BrokerServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
    channels: ChannelMap,
}

impl BrokerServer {
    pub fn new(socket_path: impl Into<PathBuf>, cancel_token: CancellationToken) -> Self {
        Self {
            socket_path: socket_path.into(),
            cancel_token,
            connection_counter: AtomicU64::new(0),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_default_path(cancel_token: CancellationToken) -> Self {
        Self::new(DEFAULT_BROKER_SOCKET, cancel_token)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Listens until the cancellation token fires, then removes the socket.
    pub async fn run(&self) -> Result<(), BrokerError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| BrokerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| BrokerError::SocketSetup {
                    path: self.socket_path.clone(),
                    error: e.to_string(),
                })?;
            }
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| BrokerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;

        info!(socket = %self.socket_path.display(), "Relay broker listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Broker shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let channels = Arc::clone(&self.channels);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let handler = BrokerConnection::new(
                reader,
                writer,
                Arc::clone(&channels),
                connection_number,
            );

            tokio::select! {
                _ = handler.run() => {}
                _ = cancel_token.cancelled() => {
                    debug!(connection = connection_number, "Closing client for shutdown");
                }
            }

            remove_subscriber(&channels, connection_number).await;
        });
    }

    /// Subscribers currently attached to `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, HashMap::len)
    }

    async fn cleanup(&self) {
        self.channels.write().await.clear();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Broker cleanup complete");
    }
}

/// Drops `connection_number` from every channel.
pub(crate) async fn remove_subscriber(channels: &ChannelMap, connection_number: u64) {
    let mut map = channels.write().await;
    let mut removed = 0usize;
    for subscribers in map.values_mut() {
        if subscribers.remove(&connection_number).is_some() {
            removed += 1;
        }
    }
    map.retain(|_, subscribers| !subscribers.is_empty());

    if removed > 0 {
        debug!(connection = connection_number, channels = removed, "Removed subscriber");
    }
}

/// Queues `payload` for every subscriber of `channel` and returns how many
/// took it. Never waits on a subscriber; closed queues are removed.
pub(crate) async fn fanout(channels: &ChannelMap, channel: &str, payload: &str) -> usize {
    let frame: Arc<str> = match encode_frame(&BrokerMessage::message(channel, payload)) {
        Ok(frame) => Arc::from(frame),
        Err(e) => {
            error!(channel, error = %e, "Failed to encode broker message");
            return 0;
        }
    };

    let map = channels.read().await;
    let Some(subscribers) = map.get(channel) else {
        return 0;
    };

    let mut queued = 0usize;
    let mut closed = Vec::new();
    for (&connection_number, queue) in subscribers {
        match queue.try_send(Arc::clone(&frame)) {
            Ok(()) => queued += 1,
            Err(TrySendError::Full(_)) => {
                warn!(connection = connection_number, channel, "Subscriber queue full, message dropped");
            }
            Err(TrySendError::Closed(_)) => closed.push(connection_number),
        }
    }
    drop(map);

    for connection_number in closed {
        remove_subscriber(channels, connection_number).await;
    }
    queued
}

/// Errors that can occur in broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
