//! The process-wide relay listener.
//!
//! Holds the only subscription to the photo channel, validates each payload
//! and hands it to the broadcaster. Subscription failures never escape: the
//! listener logs, marks the relay disconnected, drops the old subscription,
//! waits out a backoff and subscribes again. A panic inside a subscription
//! session counts as a failure and goes through the same restart path.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wall_core::PhotoRecord;

use super::{Relay, RelayError, RelayMessage, RelaySubscription, RestartBackoff};
use crate::fanout::Broadcaster;

// ============================================================================
// Status
// ============================================================================

/// Listener state shared with the health endpoint.
#[derive(Debug, Default)]
pub struct RelayStatus {
    connected: AtomicBool,
    restarts: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
    active_subscriptions: AtomicUsize,
}

impl RelayStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Subscription restarts since start-up.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Records received and handed to the broadcaster.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Payloads dropped because they were not valid photo records.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Subscriptions currently held open by the listener. Never above one.
    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(Ordering::SeqCst)
    }

    fn track(&self) -> ActiveSubscription<'_> {
        self.active_subscriptions.fetch_add(1, Ordering::SeqCst);
        ActiveSubscription { status: self }
    }
}

struct ActiveSubscription<'a> {
    status: &'a RelayStatus,
}

impl Drop for ActiveSubscription<'_> {
    fn drop(&mut self) {
        self.status.active_subscriptions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Clears `connected` however the listener task ends, abort included.
struct ConnectedFlag<'a> {
    status: &'a RelayStatus,
}

impl Drop for ConnectedFlag<'_> {
    fn drop(&mut self) {
        self.status.connected.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Subscription slot
// ============================================================================

/// Admission for the single listener. Claiming twice fails until the first
/// claim is released.
#[derive(Debug, Default)]
pub struct SubscriptionSlot {
    taken: AtomicBool,
}

impl SubscriptionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(self: &Arc<Self>, channel: &str) -> Result<SlotGuard, RelayError> {
        self.taken
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| RelayError::AlreadySubscribed {
                channel: channel.to_string(),
            })?;
        Ok(SlotGuard {
            slot: Arc::clone(self),
        })
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::SeqCst)
    }
}

/// Releases the slot on drop.
#[derive(Debug)]
pub struct SlotGuard {
    slot: Arc<SubscriptionSlot>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.taken.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Listener
// ============================================================================

enum Ended {
    Cancelled,
    Failed(RelayError),
}

pub struct RelayListener {
    relay: Arc<dyn Relay>,
    channel: String,
    broadcaster: Arc<Broadcaster>,
    status: Arc<RelayStatus>,
    backoff: RestartBackoff,
    cancel: CancellationToken,
    _slot: SlotGuard,
}

impl RelayListener {
    /// Claims `slot` and builds a listener. Fails with
    /// [`RelayError::AlreadySubscribed`] if another listener holds it.
    pub fn new(
        slot: &Arc<SubscriptionSlot>,
        relay: Arc<dyn Relay>,
        channel: impl Into<String>,
        broadcaster: Arc<Broadcaster>,
        status: Arc<RelayStatus>,
        backoff: RestartBackoff,
        cancel: CancellationToken,
    ) -> Result<Self, RelayError> {
        let channel = channel.into();
        let guard = slot.claim(&channel)?;
        Ok(Self {
            relay,
            channel,
            broadcaster,
            status,
            backoff,
            cancel,
            _slot: guard,
        })
    }

    /// Runs until cancelled.
    pub async fn run(self) {
        info!(channel = %self.channel, relay = self.relay.name(), "Relay listener starting");
        let _connected = ConnectedFlag {
            status: &self.status,
        };
        let mut attempt = 0u32;

        loop {
            let session = AssertUnwindSafe(self.session(&mut attempt))
                .catch_unwind()
                .await;

            let failure = match session {
                Ok(Ended::Cancelled) => break,
                Ok(Ended::Failed(e)) => e,
                Err(panic) => RelayError::Panicked(panic_message(&*panic)),
            };

            // The previous subscription is already dropped here.
            self.status.connected.store(false, Ordering::SeqCst);
            self.status.restarts.fetch_add(1, Ordering::Relaxed);

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            error!(
                channel = %self.channel,
                error = %failure,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Relay listener failed, restarting"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(channel = %self.channel, "Relay listener stopped");
    }

    /// One subscribe-and-listen cycle.
    async fn session(&self, attempt: &mut u32) -> Ended {
        let subscribed = tokio::select! {
            _ = self.cancel.cancelled() => return Ended::Cancelled,
            result = self.relay.subscribe(&self.channel) => result,
        };

        match subscribed {
            Ok(subscription) => {
                self.status.connected.store(true, Ordering::SeqCst);
                *attempt = 0;
                info!(channel = %self.channel, "Relay subscription established");
                self.listen(subscription).await
            }
            Err(e) => Ended::Failed(e),
        }
    }

    async fn listen(&self, mut subscription: RelaySubscription) -> Ended {
        let _active = self.status.track();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ended::Cancelled,
                next = subscription.next() => next,
            };

            match next {
                Some(Ok(message)) => self.deliver(message).await,
                Some(Err(e)) => return Ended::Failed(e),
                None => return Ended::Failed(RelayError::Closed),
            }
        }
    }

    async fn deliver(&self, message: RelayMessage) {
        // Validate before fan-out so viewers only ever see well-formed records.
        if let Err(e) = PhotoRecord::from_json(&message.payload) {
            self.status.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %message.channel, error = %e, "Dropping malformed relay payload");
            return;
        }

        self.status.received.fetch_add(1, Ordering::Relaxed);
        let report = self.broadcaster.broadcast_frame(Arc::from(message.payload)).await;
        debug!(
            delivered = report.delivered,
            failed = report.failed.len(),
            "Relay message broadcast"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_admits_one_claim() {
        let slot = Arc::new(SubscriptionSlot::new());
        let first = slot.claim("photos").unwrap();

        assert!(matches!(
            slot.claim("photos"),
            Err(RelayError::AlreadySubscribed { .. })
        ));

        drop(first);
        assert!(!slot.is_taken());
        assert!(slot.claim("photos").is_ok());
    }

    #[tokio::test]
    async fn test_malformed_payloads_are_dropped() {
        use crate::fanout::FanoutSettings;
        use crate::registry::ConnectionRegistry;
        use crate::relay::MemoryRelay;
        use std::time::Duration;

        let relay = Arc::new(MemoryRelay::new());
        let status = Arc::new(RelayStatus::new());
        let cancel = CancellationToken::new();
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::new(ConnectionRegistry::new(1)),
            FanoutSettings {
                chunk_size: 4,
                send_timeout: Duration::from_secs(1),
                dispatch_delay: None,
            },
        ));

        let listener = RelayListener::new(
            &Arc::new(SubscriptionSlot::new()),
            Arc::clone(&relay) as Arc<dyn Relay>,
            "photos",
            broadcaster,
            Arc::clone(&status),
            RestartBackoff::default(),
            cancel.clone(),
        )
        .unwrap();
        let handle = tokio::spawn(listener.run());

        while relay.subscriber_count("photos") == 0 {
            tokio::task::yield_now().await;
        }

        let record = wall_core::Submission::new(vec![1, 2, 3]).into_record();
        relay.publish("photos", "not a record".to_string()).await.unwrap();
        relay.publish("photos", record.to_json().unwrap()).await.unwrap();

        while status.received() + status.rejected() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(status.received(), 1);
        assert_eq!(status.rejected(), 1);
        assert!(status.is_connected());

        cancel.cancel();
        handle.await.unwrap();
        assert!(!status.is_connected());
        assert_eq!(status.active_subscriptions(), 0);
    }

    /// Hands out subscriptions whose stream panics on first poll until
    /// `panics` runs out, then behaves like the in-process relay.
    struct PanickingRelay {
        inner: crate::relay::MemoryRelay,
        panics: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Relay for PanickingRelay {
        async fn publish(&self, channel: &str, payload: String) -> Result<(), RelayError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<RelaySubscription, RelayError> {
            let remaining = self.panics.load(Ordering::SeqCst);
            if remaining == 0 {
                return self.inner.subscribe(channel).await;
            }
            self.panics.store(remaining - 1, Ordering::SeqCst);

            use futures::StreamExt;
            use std::task::Poll;
            let stream = futures::stream::poll_fn(
                |_| -> Poll<Option<Result<RelayMessage, RelayError>>> {
                    panic!("subscription stream corrupted")
                },
            );
            Ok(RelaySubscription::new(channel, stream.boxed()))
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_panicking_subscription_is_restarted() {
        use crate::fanout::FanoutSettings;
        use crate::registry::ConnectionRegistry;
        use std::time::Duration;

        let relay = Arc::new(PanickingRelay {
            inner: crate::relay::MemoryRelay::new(),
            panics: AtomicUsize::new(3),
        });
        let status = Arc::new(RelayStatus::new());
        let cancel = CancellationToken::new();
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::new(ConnectionRegistry::new(1)),
            FanoutSettings {
                chunk_size: 4,
                send_timeout: Duration::from_secs(1),
                dispatch_delay: None,
            },
        ));

        let listener = RelayListener::new(
            &Arc::new(SubscriptionSlot::new()),
            Arc::clone(&relay) as Arc<dyn Relay>,
            "photos",
            broadcaster,
            Arc::clone(&status),
            RestartBackoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            cancel.clone(),
        )
        .unwrap();
        let handle = tokio::spawn(listener.run());

        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.inner.subscriber_count("photos") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener never recovered");

        assert_eq!(status.restarts(), 3);
        assert!(status.is_connected());
        assert_eq!(status.active_subscriptions(), 1);

        let record = wall_core::Submission::new(vec![7]).into_record();
        relay
            .inner
            .publish("photos", record.to_json().unwrap())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while status.received() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recovered listener did not deliver");

        cancel.cancel();
        // The task itself never died.
        handle.await.unwrap();
        assert!(!status.is_connected());
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*boxed), "static message");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(&*boxed), "owned message");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }

    #[test]
    fn test_active_subscription_tracking() {
        let status = RelayStatus::new();
        {
            let _a = status.track();
            assert_eq!(status.active_subscriptions(), 1);
        }
        assert_eq!(status.active_subscriptions(), 0);
    }
}
