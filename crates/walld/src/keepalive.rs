//! Liveness sweep.
//!
//! Viewers send a text `ping` every few seconds and any inbound frame counts
//! as activity. Connections silent for longer than the liveness window are
//! unregistered, which also ends their read loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use wall_core::ConnectionId;

use crate::registry::{ConnectionRegistry, RemovalReason};

/// Text frame viewers send as a heartbeat.
pub const PING: &str = "ping";

/// Reply to [`PING`].
pub const PONG: &str = "pong";

/// Unregisters every connection idle for longer than `window`.
pub fn sweep_once(registry: &ConnectionRegistry, window: Duration) -> Vec<ConnectionId> {
    let expired: Vec<ConnectionId> = registry
        .snapshot()
        .into_iter()
        .filter(|conn| conn.idle_for() > window)
        .filter_map(|conn| {
            registry
                .unregister(conn.id(), RemovalReason::LivenessExpired)
                .map(|c| c.id())
        })
        .collect();

    if !expired.is_empty() {
        info!(count = expired.len(), "Pruned idle viewers");
    }
    expired
}

/// Runs [`sweep_once`] every `interval` until cancelled.
pub async fn run_sweep(
    registry: Arc<ConnectionRegistry>,
    window: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; nothing can be stale yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Keepalive sweep stopped");
                return;
            }
            _ = ticker.tick() => {
                let expired = sweep_once(&registry, window);
                for id in &expired {
                    debug!(connection = %id, "Liveness window expired");
                }
            }
        }
    }
}
