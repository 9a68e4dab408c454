//! Front-door API for starting flows and feeding responses in
//!
//! The engine is the surface that frontends (RPC handlers, admin tools,
//! tests) talk to. Everything that runs handlers goes through the
//! [`FlowRunner`]; the engine adds ingress concerns on top: well-known
//! routing, authentication filtering and blocking lock acquisition.

use crate::{
    application::runtime::{FlowRunner, StartRequest},
    config::EngineConfig,
    domain::flow::{ClientId, Flow, FlowStatus, SessionId},
    domain::lease::{acquire_blocking, LeaseGuard, LeaseManager},
    domain::message::{AuthState, Response},
    domain::registry::FlowRegistry,
    domain::repository::{FlowStore, MessageQueue, TaskSink},
    EngineError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The flow engine front door
pub struct FlowEngine {
    registry: Arc<FlowRegistry>,
    flow_store: Arc<dyn FlowStore>,
    queue: Arc<dyn MessageQueue>,
    lease_manager: Arc<dyn LeaseManager>,
    config: EngineConfig,
    runner: FlowRunner,
}

impl FlowEngine {
    /// Wire an engine over the given stores
    pub fn new(
        registry: Arc<FlowRegistry>,
        flow_store: Arc<dyn FlowStore>,
        queue: Arc<dyn MessageQueue>,
        task_sink: Arc<dyn TaskSink>,
        lease_manager: Arc<dyn LeaseManager>,
        config: EngineConfig,
    ) -> Self {
        let runner = FlowRunner::new(
            Arc::clone(&registry),
            Arc::clone(&flow_store),
            Arc::clone(&queue),
            task_sink,
            Arc::clone(&lease_manager),
            config.clone(),
        );
        Self {
            registry,
            flow_store,
            queue,
            lease_manager,
            config,
            runner,
        }
    }

    /// The runner behind this engine, for wiring workers
    pub fn runner(&self) -> &FlowRunner {
        &self.runner
    }

    /// Start a flow; the initial handler runs before this returns
    pub async fn start_flow(&self, start: StartRequest) -> Result<SessionId, EngineError> {
        self.runner.start_flow(start).await
    }

    /// Terminate a flow (and its children) with a reason
    pub async fn terminate_flow(
        &self,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<(), EngineError> {
        self.runner.terminate_flow(session_id, reason).await
    }

    /// Accept inbound responses for a session
    ///
    /// Well-known sessions bypass the queue entirely and are dispatched
    /// message by message. For regular flows, unauthenticated responses
    /// are dropped at the door unless the flow's type accepts them; what
    /// remains is written as one batch.
    pub async fn accept_responses(
        &self,
        session_id: &SessionId,
        responses: Vec<Response>,
    ) -> Result<(), EngineError> {
        if let Some(well_known) = self.registry.get_well_known(session_id) {
            for response in responses {
                well_known.process_message(response).await?;
            }
            return Ok(());
        }

        let flow = self
            .flow_store
            .find(session_id)
            .await?
            .ok_or_else(|| EngineError::UnknownFlow(session_id.to_string()))?;
        if !flow.is_running() {
            debug!(session = %session_id, "responses for a finished flow, dropping");
            return Ok(());
        }

        let accepts_unauthenticated = self
            .registry
            .get(&flow.flow_type)?
            .descriptor()
            .accepts_unauthenticated;
        let accepted: Vec<Response> = responses
            .into_iter()
            .filter(|r| {
                if r.auth == AuthState::Authenticated || accepts_unauthenticated {
                    true
                } else {
                    warn!(
                        session = %session_id,
                        request = r.request_id.0,
                        "dropping unauthenticated response"
                    );
                    false
                }
            })
            .collect();
        if accepted.is_empty() {
            return Ok(());
        }
        self.queue
            .write_responses(session_id, accepted, None)
            .await
    }

    /// Take a flow's lease, waiting up to `timeout` for the current
    /// holder to let go
    pub async fn acquire_lock(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> Result<LeaseGuard, EngineError> {
        let lease = acquire_blocking(
            self.lease_manager.as_ref(),
            session_id,
            self.config.worker_lease(),
            timeout,
            self.config.lease_retry_initial(),
            self.config.lease_retry_max(),
        )
        .await?;
        Ok(LeaseGuard::new(lease, Arc::clone(&self.lease_manager)))
    }

    /// Look up a flow record
    pub async fn flow(&self, session_id: &SessionId) -> Result<Option<Flow>, EngineError> {
        self.flow_store.find(session_id).await
    }

    /// List flows, optionally filtered by client and status
    pub async fn list_flows(
        &self,
        client_id: Option<&ClientId>,
        status: Option<FlowStatus>,
    ) -> Result<Vec<Flow>, EngineError> {
        self.flow_store.list(client_id, status).await
    }
}
