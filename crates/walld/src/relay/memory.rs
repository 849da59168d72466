//! In-process relay backed by `tokio::sync::broadcast`.
//!
//! Used for single-process deployments and tests. It can be taken offline to
//! exercise the listener's restart path: going offline closes every open
//! subscription and fails publishes until it comes back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{Relay, RelayError, RelayMessage, RelaySubscription};

/// Messages buffered per channel for a slow subscriber before it lags.
const CHANNEL_BUFFER: usize = 1024;

pub struct MemoryRelay {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    online: AtomicBool,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Simulates a broker outage. Open subscriptions end, and publish and
    /// subscribe fail until [`MemoryRelay::reconnect`].
    pub fn disconnect(&self) {
        self.online.store(false, Ordering::SeqCst);
        // Dropping the senders closes every receiver.
        let dropped = std::mem::take(&mut *self.channels.lock());
        debug!(channels = dropped.len(), "Memory relay taken offline");
    }

    pub fn reconnect(&self) {
        self.online.store(true, Ordering::SeqCst);
        debug!("Memory relay back online");
    }

    fn ensure_online(&self) -> Result<(), RelayError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::Unavailable("memory relay is offline".to_string()))
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
            .clone()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), RelayError> {
        self.ensure_online()?;
        // No subscribers is not an error: the message is simply lost.
        let receivers = self.sender(channel).send(payload).unwrap_or(0);
        debug!(channel, receivers, "Published to memory relay");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription, RelayError> {
        self.ensure_online()?;
        let rx = self.sender(channel).subscribe();
        let name = channel.to_string();

        let stream = futures::stream::unfold(rx, move |mut rx| {
            let channel = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => {
                            return Some((Ok(RelayMessage { channel, payload }), rx));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(RelaySubscription::new(channel, stream.boxed()))
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
