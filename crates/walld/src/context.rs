//! Process context and task supervision.
//!
//! `WallContext` owns every shared component (queue, registry, broadcaster,
//! relay and their counters) and is handed to each component explicitly.
//! Its [`Supervisor`] keeps a handle for every long-lived task so shutdown
//! can cancel and reap them.
//!
//! # Shutdown sequence
//!
//! 1. Close the ingestion queue; new submissions are rejected
//! 2. Cancel the supervisor token; workers stop after their current item,
//!    the relay listener drops its subscription, the sweep exits
//! 3. Wait for tasks up to the grace period, then abort what is left
//! 4. Remove every viewer connection
//!
//! Items still buffered in the queue are dropped, not drained.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wall_core::{Submission, SubmissionId};

use crate::config::{RelayKind, WallConfig};
use crate::fanout::{Broadcaster, FanoutSettings};
use crate::health::{self, HealthInputs, HealthResponse, WsStatusResponse};
use crate::keepalive;
use crate::queue::{EnqueueError, IngestionQueue, Rejected};
use crate::registry::{ConnectionRegistry, RemovalReason};
use crate::relay::{
    MemoryRelay, Relay, RelayError, RelayListener, RelayStatus, RestartBackoff, SocketRelay,
    SubscriptionSlot,
};
use crate::workers::{self, WorkerSettings, WorkerStats};

// ============================================================================
// Supervisor
// ============================================================================

struct SupervisedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// What happened to supervised tasks during shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished within the grace period
    pub completed: usize,
    /// Tasks aborted after the grace period
    pub aborted: Vec<String>,
    /// Viewer connections closed
    pub connections_closed: usize,
}

/// Holds the handles of long-lived tasks under a shared cancellation token.
pub struct Supervisor {
    token: CancellationToken,
    tasks: Mutex<Vec<SupervisedTask>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawns `fut` and keeps its handle.
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.track(name, tokio::spawn(fut));
    }

    pub fn track(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        let name = name.into();
        debug!(task = %name, "Supervising task");
        self.tasks.lock().push(SupervisedTask { name, handle });
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Names of tasks that have not finished.
    pub fn running(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.name.clone())
            .collect()
    }

    /// Cancels the token and waits up to `grace` for every task, aborting
    /// the ones still running afterwards.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        info!(
            task_count = tasks.len(),
            grace_ms = grace.as_millis() as u64,
            "Waiting for tasks to complete"
        );

        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();
        for SupervisedTask { name, mut handle } in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.completed += 1,
                Ok(Err(e)) => {
                    warn!(task = %name, error = %e, "Task ended abnormally");
                    report.completed += 1;
                }
                Err(_) => {
                    warn!(task = %name, "Task did not stop in time, aborting");
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }
        report
    }
}

// ============================================================================
// Context
// ============================================================================

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context already started")]
    AlreadyStarted,

    #[error("context is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// How an accepted submission will reach the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Buffered for the worker pool
    Queued(SubmissionId),
    /// Queue was full; published directly
    PublishedDirect(SubmissionId),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("not accepting submissions: shutting down")]
    ShuttingDown,

    #[error("queue full and direct publish failed: {0}")]
    Unavailable(RelayError),
}

/// Builds the relay backend named in the config.
pub fn relay_from_config(config: &WallConfig) -> Arc<dyn Relay> {
    match config.relay.kind {
        RelayKind::Memory => Arc::new(MemoryRelay::new()),
        RelayKind::Socket => Arc::new(SocketRelay::new(config.relay.broker_socket.clone())),
    }
}

pub struct WallContext {
    config: WallConfig,
    queue: Arc<IngestionQueue>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    relay: Arc<dyn Relay>,
    relay_status: Arc<RelayStatus>,
    worker_stats: Arc<WorkerStats>,
    slot: Arc<SubscriptionSlot>,
    supervisor: Supervisor,
    started: AtomicBool,
    started_at: Instant,
}

impl WallContext {
    pub fn new(config: WallConfig, relay: Arc<dyn Relay>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.pools));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            FanoutSettings {
                chunk_size: config.chunk_size,
                send_timeout: config.send_timeout(),
                dispatch_delay: config.dispatch_delay(),
            },
        ));

        Self {
            queue: Arc::new(IngestionQueue::new(config.queue_capacity)),
            registry,
            broadcaster,
            relay,
            relay_status: Arc::new(RelayStatus::new()),
            worker_stats: Arc::new(WorkerStats::default()),
            slot: Arc::new(SubscriptionSlot::new()),
            supervisor: Supervisor::new(),
            started: AtomicBool::new(false),
            started_at: Instant::now(),
            config,
        }
    }

    /// Builds a context with the relay backend the config names.
    pub fn from_config(config: WallConfig) -> Self {
        let relay = relay_from_config(&config);
        Self::new(config, relay)
    }

    /// Spawns the workers, the relay listener and the keepalive sweep.
    pub fn start(&self) -> Result<(), ContextError> {
        if self.supervisor.is_shutting_down() {
            return Err(ContextError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ContextError::AlreadyStarted);
        }

        let listener = RelayListener::new(
            &self.slot,
            Arc::clone(&self.relay),
            self.config.relay.channel.clone(),
            Arc::clone(&self.broadcaster),
            Arc::clone(&self.relay_status),
            RestartBackoff::new(
                Duration::from_millis(self.config.relay.restart_initial_ms),
                Duration::from_millis(self.config.relay.restart_max_ms),
            ),
            self.supervisor.token(),
        )?;
        self.supervisor.spawn("relay-listener", listener.run());

        let settings = WorkerSettings {
            workers: self.config.workers,
            permits: self.config.permits,
            channel: self.config.relay.channel.clone(),
        };
        let handles = workers::spawn_workers(
            &settings,
            Arc::clone(&self.queue),
            Arc::clone(&self.relay),
            Arc::clone(&self.worker_stats),
            self.supervisor.token(),
        );
        for (index, handle) in handles.into_iter().enumerate() {
            self.supervisor.track(format!("worker-{index}"), handle);
        }

        self.supervisor.spawn(
            "keepalive",
            keepalive::run_sweep(
                Arc::clone(&self.registry),
                self.config.liveness_window(),
                self.config.sweep_interval(),
                self.supervisor.token(),
            ),
        );

        info!(
            relay = self.relay.name(),
            workers = self.config.workers,
            permits = self.config.permits,
            pools = self.config.pools,
            queue_capacity = self.config.queue_capacity,
            "Wall context started"
        );
        Ok(())
    }

    /// Accepts a submission: queued normally, published directly when the
    /// queue is full.
    pub async fn submit(&self, submission: Submission) -> Result<SubmitOutcome, SubmitError> {
        let id = submission.id().clone();
        match self.queue.enqueue(submission) {
            Ok(()) => Ok(SubmitOutcome::Queued(id)),
            Err(Rejected {
                reason: EnqueueError::Closed,
                ..
            }) => Err(SubmitError::ShuttingDown),
            Err(Rejected {
                submission,
                reason: EnqueueError::Full { capacity },
            }) => {
                warn!(submission = %id, capacity, "Ingestion queue full, publishing directly");
                workers::publish_submission(
                    self.relay.as_ref(),
                    &self.config.relay.channel,
                    submission,
                )
                .await
                .map(SubmitOutcome::PublishedDirect)
                .map_err(|e| {
                    warn!(submission = %id, error = %e, "Direct publish failed");
                    SubmitError::Unavailable(e)
                })
            }
        }
    }

    /// Runs the shutdown sequence. Safe to call more than once.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Wall context shutting down");
        self.queue.close();

        let mut report = self.supervisor.shutdown(self.config.shutdown_grace()).await;

        let closed = self.registry.drain(RemovalReason::Shutdown);
        for conn in &closed {
            conn.close_transport().await;
        }
        report.connections_closed = closed.len();

        info!(
            published = self.worker_stats.published(),
            failed = self.worker_stats.failed(),
            broadcasts = self.broadcaster.stats().broadcasts(),
            pruned = self.broadcaster.stats().pruned(),
            listener_restarts = self.relay_status.restarts(),
            aborted = report.aborted.len(),
            connections_closed = report.connections_closed,
            "Wall context stopped"
        );
        report
    }

    pub fn health(&self) -> HealthResponse {
        health::health_check(HealthInputs {
            uptime_secs: self.started_at.elapsed().as_secs(),
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            relay_connected: self.relay_status.is_connected(),
            listener_restarts: self.relay_status.restarts(),
            connections: self.registry.len(),
            published: self.worker_stats.published(),
            publish_failures: self.worker_stats.failed(),
        })
    }

    pub fn ws_status(&self) -> WsStatusResponse {
        health::ws_status(&self.registry.pool_stats())
    }

    pub fn config(&self) -> &WallConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<IngestionQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn relay(&self) -> &Arc<dyn Relay> {
        &self.relay
    }

    pub fn relay_status(&self) -> &Arc<RelayStatus> {
        &self.relay_status
    }

    pub fn worker_stats(&self) -> &Arc<WorkerStats> {
        &self.worker_stats
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Cancelled when shutdown begins.
    pub fn cancel_token(&self) -> CancellationToken {
        self.supervisor.token()
    }

    /// Wraps `self` in an `Arc` for the HTTP surface.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}
