//! Bounded ingestion queue between producers and the worker pool.
//!
//! `enqueue` never waits: a full queue rejects immediately so the ingress
//! side can fall back to a direct publish. `dequeue` suspends until an item
//! arrives or the queue is closed. Closing does not drain; buffered items
//! are dropped with the queue.
//!
//! The buffer sits behind a single mutex since producers and workers contend
//! on it directly. The lock is never held across an await.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use wall_core::Submission;

/// Errors returned to producers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// Queue is at capacity; the caller must apply its fallback
    #[error("ingestion queue is full (capacity: {capacity})")]
    Full { capacity: usize },

    /// Queue has been shut down
    #[error("ingestion queue is closed")]
    Closed,
}

/// Outcome of a rejected enqueue, handing the submission back to the caller.
#[derive(Debug)]
pub struct Rejected {
    pub submission: Submission,
    pub reason: EnqueueError,
}

struct QueueState {
    items: VecDeque<Submission>,
    closed: bool,
}

/// Bounded FIFO of submissions.
pub struct IngestionQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    available: Notify,
}

impl IngestionQueue {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// A zero capacity is raised to one; config validation rejects zero
    /// before it gets here.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                // Capacity is large (10^5+); grow on demand rather than up front.
                items: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Appends a submission, or hands it back if the queue is full or closed.
    pub fn enqueue(&self, submission: Submission) -> Result<(), Rejected> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Rejected {
                    submission,
                    reason: EnqueueError::Closed,
                });
            }
            if state.items.len() >= self.capacity {
                return Err(Rejected {
                    submission,
                    reason: EnqueueError::Full {
                        capacity: self.capacity,
                    },
                });
            }
            state.items.push_back(submission);
        }

        self.available.notify_one();
        Ok(())
    }

    /// Removes the oldest submission, waiting for one if the queue is empty.
    ///
    /// Returns `None` once the queue is closed; this is the workers' signal
    /// to stop.
    pub async fn dequeue(&self) -> Option<Submission> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register interest before checking so a close or push between
            // the check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    let more = !state.items.is_empty();
                    drop(state);
                    if more {
                        // Pass the baton: a push may have been consumed by
                        // us while another worker was also waiting.
                        self.available.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Closes the queue: producers are rejected, waiting workers wake with
    /// `None`, and buffered items are discarded.
    pub fn close(&self) {
        let dropped = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let dropped = state.items.len();
            state.items.clear();
            dropped
        };

        debug!(dropped, "Ingestion queue closed");
        self.available.notify_waiters();
    }

    /// Number of items currently buffered, always within `0..=capacity`.
    pub fn depth(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
