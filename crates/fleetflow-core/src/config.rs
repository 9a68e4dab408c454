//! Engine and worker configuration
//!
//! Plain serde structs with defaults; constructed once at startup and
//! passed into the engine and worker by value. No ambient global state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by the engine and the worker loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a worker's processing lease on a flow lasts, in seconds.
    /// A flow that has not heartbeated within this window is considered
    /// stuck and is forcibly terminated.
    pub worker_lease_secs: u64,

    /// Minimum delay before re-delivering a notification that was observed
    /// before its responses were fully readable, in milliseconds. A tunable,
    /// not a proven bound; see the queue layer docs.
    pub notification_requeue_delay_ms: u64,

    /// Initial sleep between blocking lease-acquisition retries, in
    /// milliseconds. Doubles on every retry.
    pub lease_retry_initial_ms: u64,

    /// Upper bound on the lease-acquisition retry sleep, in milliseconds.
    pub lease_retry_max_ms: u64,

}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_lease_secs: 600,
            notification_requeue_delay_ms: 500,
            lease_retry_initial_ms: 50,
            lease_retry_max_ms: 2_000,
        }
    }
}

impl EngineConfig {
    /// Worker lease time as a chrono duration
    pub fn worker_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.worker_lease_secs as i64)
    }

    /// Notification re-queue delay as a chrono duration
    pub fn notification_requeue_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.notification_requeue_delay_ms as i64)
    }

    /// Initial lease retry sleep
    pub fn lease_retry_initial(&self) -> Duration {
        Duration::from_millis(self.lease_retry_initial_ms)
    }

    /// Maximum lease retry sleep
    pub fn lease_retry_max(&self) -> Duration {
        Duration::from_millis(self.lease_retry_max_ms)
    }
}

/// Configuration of one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity recorded on flows this worker is processing
    pub worker_id: String,

    /// Maximum number of distinct flows processed in parallel by one
    /// `run_once` call
    pub pool_size: usize,

    /// Maximum notifications fetched per `run_once` call
    pub notification_batch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            pool_size: 8,
            notification_batch: 100,
        }
    }
}
