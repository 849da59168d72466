//! Worker pool draining the ingestion queue into the relay.
//!
//! `N` workers pull submissions; a semaphore of `M` permits bounds how many
//! publishes are in flight at once. A failed publish is logged and counted
//! and the worker moves on; the submission is not retried.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wall_core::{Submission, SubmissionId};

use crate::queue::IngestionQueue;
use crate::relay::{Relay, RelayError};

#[derive(Debug, Default)]
pub struct WorkerStats {
    published: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
}

impl WorkerStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Publishes currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    pub permits: usize,
    pub channel: String,
}

/// Encodes `submission` and publishes it on `channel`.
///
/// Shared by the workers and the ingress fallback path.
pub async fn publish_submission(
    relay: &dyn Relay,
    channel: &str,
    submission: Submission,
) -> Result<SubmissionId, RelayError> {
    let id = submission.id().clone();
    let payload = submission
        .into_record()
        .to_json()
        .map_err(|e| RelayError::Publish(e.to_string()))?;
    relay.publish(channel, payload).await?;
    Ok(id)
}

/// Spawns the worker tasks. They stop when `cancel` fires or the queue
/// closes; an item already dequeued is still published first, waiting for a
/// permit if it has to.
pub fn spawn_workers(
    settings: &WorkerSettings,
    queue: Arc<IngestionQueue>,
    relay: Arc<dyn Relay>,
    stats: Arc<WorkerStats>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let permits = Arc::new(Semaphore::new(settings.permits.max(1)));
    info!(
        workers = settings.workers,
        permits = settings.permits,
        channel = %settings.channel,
        "Starting worker pool"
    );

    (0..settings.workers.max(1))
        .map(|worker_id| {
            let worker = Worker {
                id: worker_id,
                queue: Arc::clone(&queue),
                relay: Arc::clone(&relay),
                permits: Arc::clone(&permits),
                channel: settings.channel.clone(),
                stats: Arc::clone(&stats),
            };
            tokio::spawn(worker.run(cancel.clone()))
        })
        .collect()
}

struct Worker {
    id: usize,
    queue: Arc<IngestionQueue>,
    relay: Arc<dyn Relay>,
    permits: Arc<Semaphore>,
    channel: String,
    stats: Arc<WorkerStats>,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        loop {
            let submission = select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.queue.dequeue() => match next {
                    Some(submission) => submission,
                    None => break,
                },
            };

            // Not raced against `cancel`: the item is already off the queue.
            let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
                warn!(worker = self.id, "Permit pool closed, submission dropped");
                break;
            };

            self.stats.in_flight.fetch_add(1, Ordering::SeqCst);
            let result = publish_submission(self.relay.as_ref(), &self.channel, submission).await;
            self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);

            match result {
                Ok(id) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    debug!(worker = self.id, submission = %id, "Published submission");
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = self.id, error = %e, "Publish failed, submission dropped");
                }
            }
        }

        debug!(worker = self.id, "Worker stopped");
    }
}
