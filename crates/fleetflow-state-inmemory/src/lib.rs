//! In-memory state stores for the Fleetflow engine
//!
//! This crate implements the repository interfaces defined in
//! fleetflow-core over plain process memory. It is the store used in
//! tests, development and single-process deployments; nothing survives
//! a restart.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use tracing::debug;

pub mod lease;
pub mod repositories;

pub use lease::InMemoryLeaseManager;
pub use repositories::{InMemoryFlowStore, InMemoryMessageQueue, InMemoryTaskSink, SentTask};

use fleetflow_core::{FlowStore, LeaseManager, MessageQueue};

/// Bundle of in-memory stores sharing no state with any other bundle
pub struct InMemoryStateStore {
    /// Flow records
    pub flow_store: Arc<InMemoryFlowStore>,
    /// Requests, responses and notifications
    pub queue: Arc<InMemoryMessageQueue>,
    /// Outbound task recorder
    pub task_sink: Arc<InMemoryTaskSink>,
    /// Per-session leases
    pub lease_manager: Arc<InMemoryLeaseManager>,
}

impl InMemoryStateStore {
    /// Create a fresh, empty store bundle
    pub fn new() -> Self {
        debug!("creating in-memory state store");
        Self {
            flow_store: Arc::new(InMemoryFlowStore::new()),
            queue: Arc::new(InMemoryMessageQueue::new()),
            task_sink: InMemoryTaskSink::new(),
            lease_manager: Arc::new(InMemoryLeaseManager::new()),
        }
    }

    /// The flow store as the trait object the engine takes
    pub fn flow_store(&self) -> Arc<dyn FlowStore> {
        Arc::clone(&self.flow_store) as Arc<dyn FlowStore>
    }

    /// The queue as the trait object the engine takes
    pub fn queue(&self) -> Arc<dyn MessageQueue> {
        Arc::clone(&self.queue) as Arc<dyn MessageQueue>
    }

    /// The lease manager as the trait object the engine takes
    pub fn lease_manager(&self) -> Arc<dyn LeaseManager> {
        Arc::clone(&self.lease_manager) as Arc<dyn LeaseManager>
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}
