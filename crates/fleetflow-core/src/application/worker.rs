//! The worker scheduling loop
//!
//! Workers poll the notification queue, take per-flow leases, and drain
//! ready flows through the runtime. Distinct flows run on a bounded
//! pool; a single flow is never parallelized with itself because its
//! lease is held for the whole pass. Stuck flows (no heartbeat within
//! the processing deadline) are forcibly terminated here.

use crate::{
    application::runtime::FlowRunner,
    config::{EngineConfig, WorkerConfig},
    domain::flow::{SessionId, WorkerId},
    domain::lease::{LeaseGuard, LeaseManager},
    domain::message::Notification,
    domain::repository::{FlowStore, MessageQueue},
    EngineError,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Observable lifecycle checkpoints emitted by the worker
///
/// Tests await these instead of blocking on internals.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A flow's lease was acquired for processing
    LeaseAcquired(SessionId),
    /// A flow was skipped because another worker owns its lease
    LeaseBusy(SessionId),
    /// A handler is about to run
    HandlerEntered {
        /// Session being processed
        session_id: SessionId,
        /// Name of the entered state
        state: String,
    },
    /// The flow record was persisted and its lease released
    FlowPersisted(SessionId),
    /// A stuck flow was forcibly terminated
    StuckFlowKilled(SessionId),
    /// A notification outran its data and was re-queued with a delay
    NotificationRequeued(SessionId),
}

/// Counters from one `run_once` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Flows that had at least one batch delivered
    pub processed: usize,
    /// Sessions skipped because their lease was busy
    pub skipped_busy: usize,
    /// Stuck flows forcibly terminated
    pub stuck_killed: usize,
    /// Notifications re-queued because their data was not yet readable
    pub requeued: usize,
}

impl RunStats {
    fn absorb(&mut self, other: RunStats) {
        self.processed += other.processed;
        self.skipped_busy += other.skipped_busy;
        self.stuck_killed += other.stuck_killed;
        self.requeued += other.requeued;
    }
}

/// A worker that drains notifications and advances flows
pub struct Worker {
    runner: FlowRunner,
    flow_store: Arc<dyn FlowStore>,
    queue: Arc<dyn MessageQueue>,
    lease_manager: Arc<dyn LeaseManager>,
    config: EngineConfig,
    worker_config: WorkerConfig,
    pool: Arc<Semaphore>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    /// Create a worker over the given collaborators
    pub fn new(
        runner: FlowRunner,
        flow_store: Arc<dyn FlowStore>,
        queue: Arc<dyn MessageQueue>,
        lease_manager: Arc<dyn LeaseManager>,
        config: EngineConfig,
        worker_config: WorkerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let pool = Arc::new(Semaphore::new(worker_config.pool_size.max(1)));
        Self {
            runner: runner.with_events(events.clone()),
            flow_store,
            queue,
            lease_manager,
            config,
            worker_config,
            pool,
            events,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// This worker's identity
    pub fn worker_id(&self) -> WorkerId {
        WorkerId(self.worker_config.worker_id.clone())
    }

    /// Drain one batch of due notifications
    ///
    /// Fetches pending notifications highest priority first, dispatches
    /// distinct flows onto the bounded pool, and waits for the batch to
    /// finish. A single flow's failure never brings the loop down.
    pub async fn run_once(&self) -> Result<RunStats, EngineError> {
        let now = Utc::now();
        let notifications = self
            .queue
            .fetch_notifications(now, self.worker_config.notification_batch)
            .await?;
        if notifications.is_empty() {
            return Ok(RunStats::default());
        }
        debug!(count = notifications.len(), "draining notifications");

        let mut tasks: JoinSet<RunStats> = JoinSet::new();
        for notification in notifications {
            let permit = Arc::clone(&self.pool)
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Other(format!("worker pool closed: {e}")))?;
            let runner = self.runner.clone();
            let flow_store = Arc::clone(&self.flow_store);
            let queue = Arc::clone(&self.queue);
            let lease_manager = Arc::clone(&self.lease_manager);
            let config = self.config.clone();
            let worker_id = self.worker_id();
            let events = self.events.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let session_id = notification.session_id.clone();
                match process_notification(
                    runner,
                    flow_store,
                    queue,
                    lease_manager,
                    config,
                    worker_id,
                    events,
                    notification,
                )
                .await
                {
                    Ok(stats) => stats,
                    Err(err) => {
                        error!(session = %session_id, "notification processing failed: {err}");
                        RunStats::default()
                    }
                }
            });
        }

        let mut stats = RunStats::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(task_stats) => stats.absorb(task_stats),
                Err(err) => error!("worker task panicked: {err}"),
            }
        }
        Ok(stats)
    }

    /// Invoke `run_once` in a loop until `shutdown` flips to true
    pub async fn run(
        &self,
        poll_interval: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        info!(worker = %self.worker_config.worker_id, "worker loop started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker = %self.worker_config.worker_id, "worker loop stopping");
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(err) = self.run_once().await {
                        error!("worker pass failed: {err}");
                    }
                }
            }
        }
    }
}

/// Process one notification end to end
#[allow(clippy::too_many_arguments)]
async fn process_notification(
    runner: FlowRunner,
    flow_store: Arc<dyn FlowStore>,
    queue: Arc<dyn MessageQueue>,
    lease_manager: Arc<dyn LeaseManager>,
    config: EngineConfig,
    worker_id: WorkerId,
    events: broadcast::Sender<WorkerEvent>,
    notification: Notification,
) -> Result<RunStats, EngineError> {
    let session_id = notification.session_id.clone();
    let mut stats = RunStats::default();

    let lease = match lease_manager
        .try_acquire(&session_id, config.worker_lease())
        .await
    {
        Ok(lease) => lease,
        Err(EngineError::LockBusy(_)) => {
            // Another worker owns the flow; not an error.
            debug!(session = %session_id, "lease busy, skipping");
            let _ = events.send(WorkerEvent::LeaseBusy(session_id));
            stats.skipped_busy += 1;
            return Ok(stats);
        }
        Err(err) => return Err(err),
    };
    let guard = LeaseGuard::new(lease, Arc::clone(&lease_manager));
    let _ = events.send(WorkerEvent::LeaseAcquired(session_id.clone()));

    let Some(mut flow) = flow_store.find(&session_id).await? else {
        // A notification with no flow behind it is stale; consume it.
        warn!(session = %session_id, "notification for unknown flow, discarding");
        queue.delete_notification(&session_id).await?;
        guard.release().await?;
        return Ok(stats);
    };

    let now = Utc::now();
    if flow.is_stuck(now) {
        // The previous processing pass neither finished nor
        // heartbeated before its deadline. Kill the flow even if it is
        // mid-execution somewhere.
        warn!(session = %session_id, "flow missed its processing deadline, terminating");
        runner.terminate_flow(&session_id, "stuck in worker").await?;
        queue.delete_notification(&session_id).await?;
        let _ = events.send(WorkerEvent::StuckFlowKilled(session_id.clone()));
        guard.release().await?;
        stats.stuck_killed += 1;
        return Ok(stats);
    }

    if !flow.is_running() {
        debug!(session = %session_id, "notification for finished flow, discarding");
        queue.delete_notification(&session_id).await?;
        guard.release().await?;
        return Ok(stats);
    }

    flow.begin_processing(worker_id, now + config.worker_lease());
    flow_store.save(&flow).await?;

    let outcome = runner.process_ready(flow, guard.lease()).await?;
    let mut flow = outcome.flow;

    queue.delete_notification(&session_id).await?;
    if outcome.delivered > 0 {
        stats.processed += 1;
    }

    if flow.is_running() && flow.outstanding_requests > 0 {
        // The per-session notification entry just deleted may have been
        // the only wake-up for work the pass could not deliver: a status
        // accepted while the pass was running, or a timer completion not
        // yet due. Re-checking after the delete closes the window.
        let recheck = Utc::now();
        let pending = queue
            .completed_requests(&session_id, chrono::DateTime::<Utc>::MAX_UTC)
            .await?;
        if let Some(earliest) = pending
            .iter()
            .map(|(request, _)| request.ready_at().unwrap_or(recheck))
            .min()
        {
            let mut wake = notification.requeued(chrono::Duration::zero());
            if earliest > recheck {
                wake.deliver_after = earliest;
            }
            queue.queue_notification(wake).await?;
            let _ = events.send(WorkerEvent::NotificationRequeued(session_id.clone()));
            stats.requeued += 1;
        } else if outcome.delivered == 0 {
            // Premature notification: the completing write is not yet
            // readable. Re-queue with the minimum delay rather than
            // drop, preserving first_queued.
            let requeued = notification.requeued(config.notification_requeue_delay());
            queue.queue_notification(requeued).await?;
            let _ = events.send(WorkerEvent::NotificationRequeued(session_id.clone()));
            stats.requeued += 1;
        }
    }

    flow.finish_processing();
    flow_store.save(&flow).await?;
    let _ = events.send(WorkerEvent::FlowPersisted(session_id.clone()));
    guard.release().await?;
    Ok(stats)
}
