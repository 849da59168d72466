//! Broadcast of one record to every registered viewer.
//!
//! A broadcast takes a registry snapshot, splits it into chunks of
//! `chunk_size` and runs one delivery task per chunk. Within a chunk sends
//! are sequential, each bounded by the send timeout. Failures are collected
//! and the failed connections are unregistered only after every chunk has
//! finished, so the snapshot is never mutated while it is being walked.
//!
//! A broadcast returns only after every chunk has finished. The relay
//! listener is the only caller in a running wall and awaits each broadcast
//! before taking the next record, so every viewer sees records in the same
//! relative order. Concurrent callers of [`Broadcaster::broadcast`] get no
//! such ordering between their records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use wall_core::{ConnectionId, PhotoRecord};

use crate::registry::{Connection, ConnectionRegistry, RemovalReason};

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections in the snapshot
    pub recipients: usize,
    pub delivered: usize,
    /// Connections that failed and were pruned
    pub failed: Vec<ConnectionId>,
    pub chunks: usize,
}

#[derive(Debug, Default)]
pub struct BroadcastStats {
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    pruned: AtomicU64,
}

impl BroadcastStats {
    pub fn broadcasts(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn pruned(&self) -> u64 {
        self.pruned.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FanoutSettings {
    pub chunk_size: usize,
    pub send_timeout: Duration,
    /// Optional pause before dispatching chunks, to smooth bursts
    pub dispatch_delay: Option<Duration>,
}

pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    settings: FanoutSettings,
    stats: BroadcastStats,
}

#[derive(Default)]
struct ChunkOutcome {
    delivered: usize,
    failed: Vec<ConnectionId>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, settings: FanoutSettings) -> Self {
        let settings = FanoutSettings {
            chunk_size: settings.chunk_size.max(1),
            ..settings
        };
        Self {
            registry,
            settings,
            stats: BroadcastStats::default(),
        }
    }

    pub fn stats(&self) -> &BroadcastStats {
        &self.stats
    }

    /// Serializes `record` once and broadcasts it.
    pub async fn broadcast(&self, record: &PhotoRecord) -> BroadcastReport {
        match record.to_json() {
            Ok(json) => self.broadcast_frame(Arc::from(json)).await,
            Err(e) => {
                error!(id = %record.id, error = %e, "Failed to encode record for broadcast");
                BroadcastReport::default()
            }
        }
    }

    /// Broadcasts an already-encoded frame.
    pub async fn broadcast_frame(&self, frame: Arc<str>) -> BroadcastReport {
        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            debug!("No viewers connected, skipping broadcast");
            return BroadcastReport::default();
        }

        if let Some(delay) = self.settings.dispatch_delay {
            tokio::time::sleep(delay).await;
        }

        let recipients = snapshot.len();
        let mut tasks = JoinSet::new();
        for chunk in snapshot.chunks(self.settings.chunk_size) {
            tasks.spawn(deliver_chunk(
                chunk.to_vec(),
                Arc::clone(&frame),
                self.settings.send_timeout,
            ));
        }
        let chunks = tasks.len();

        let mut report = BroadcastReport {
            recipients,
            chunks,
            ..BroadcastReport::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    report.delivered += outcome.delivered;
                    report.failed.extend(outcome.failed);
                }
                // The chunk's connections stay registered; the keepalive
                // sweep catches any that are actually dead.
                Err(e) => error!(error = %e, "Delivery task aborted"),
            }
        }

        // Every task has joined; prune now.
        for id in &report.failed {
            self.registry.unregister(*id, RemovalReason::SendFailed);
        }

        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .pruned
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);

        debug!(
            recipients,
            chunks,
            delivered = report.delivered,
            pruned = report.failed.len(),
            "Broadcast complete"
        );
        report
    }
}

async fn deliver_chunk(
    connections: Vec<Arc<Connection>>,
    frame: Arc<str>,
    send_timeout: Duration,
) -> ChunkOutcome {
    let mut outcome = ChunkOutcome::default();
    for conn in connections {
        match conn.send(Arc::clone(&frame), send_timeout).await {
            Ok(()) => outcome.delivered += 1,
            Err(e) => {
                warn!(connection = %conn.id(), error = %e, "Send failed, pruning connection");
                outcome.failed.push(conn.id());
            }
        }
    }
    outcome
}
