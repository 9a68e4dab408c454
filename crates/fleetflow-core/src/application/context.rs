//! The runtime API handed to flow handlers
//!
//! A handler never talks to stores or transports directly: it buffers
//! calls and replies on the context, and the runtime flushes them after
//! the handler returns. Issuing a call therefore never blocks on a
//! reply.

use crate::{
    domain::flow::{ClientId, Flow, SessionId},
    domain::lease::{Lease, LeaseManager},
    domain::repository::FlowStore,
    types::{Payload, ResourceLimits},
    EngineError, FlowState,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A buffered asynchronous call, flushed by the runtime after the
/// handler returns
#[derive(Debug, Clone)]
pub enum PendingCall {
    /// Task for the remote agent owning this session
    Client {
        /// Handler to run when the agent's replies complete
        next_state: String,
        /// Task payload
        payload: Payload,
        /// Budget snapshot for the request
        limits: ResourceLimits,
    },
    /// Child flow whose replies complete the request
    Flow {
        /// Handler to run when the child completes
        next_state: String,
        /// Registered type of the child
        flow_type: String,
        /// Start args for the child
        args: Payload,
        /// Budget snapshot for the child
        limits: ResourceLimits,
        /// Client the child runs against; `None` inherits this flow's
        client_id: Option<ClientId>,
    },
    /// Self-directed call, optionally delayed (timers)
    SelfState {
        /// Handler to run on delivery
        next_state: String,
        /// Payload delivered to the handler
        payload: Payload,
        /// Earliest delivery time
        start_time: Option<DateTime<Utc>>,
    },
}

/// Runtime API provided to a flow handler for the duration of one pass
///
/// Owns the flow record while the worker holds the flow's lease.
pub struct FlowCtx {
    flow: Flow,
    store: Arc<dyn FlowStore>,
    lease_time: chrono::Duration,
    lease: Option<(Lease, Arc<dyn LeaseManager>)>,
    pending_calls: Vec<PendingCall>,
    pending_replies: Vec<Payload>,
    terminate_reason: Option<String>,
}

impl FlowCtx {
    /// Wrap a flow record for one processing pass
    pub(crate) fn new(flow: Flow, store: Arc<dyn FlowStore>, lease_time: chrono::Duration) -> Self {
        Self {
            flow,
            store,
            lease_time,
            lease: None,
            pending_calls: Vec::new(),
            pending_replies: Vec::new(),
            terminate_reason: None,
        }
    }

    /// Attach the lease held for this pass so `heartbeat` can renew it
    pub(crate) fn with_lease(mut self, lease: Lease, manager: Arc<dyn LeaseManager>) -> Self {
        self.lease = Some((lease, manager));
        self
    }

    /// The session of the flow being processed
    pub fn session_id(&self) -> &SessionId {
        &self.flow.session_id
    }

    /// The remote agent this flow runs against, if any
    pub fn client_id(&self) -> Option<&ClientId> {
        self.flow.session_id.client_id.as_ref()
    }

    /// Read access to the flow record
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Issue an asynchronous call to this flow's remote agent
    ///
    /// The flow suspends after the handler returns; `next_state` runs
    /// once the agent's replies are complete.
    pub fn call_client<S: FlowState>(
        &mut self,
        next_state: S,
        payload: Payload,
        limits: ResourceLimits,
    ) {
        self.pending_calls.push(PendingCall::Client {
            next_state: next_state.name().to_string(),
            payload,
            limits,
        });
    }

    /// Start a child flow whose replies complete this call
    pub fn call_flow<S: FlowState>(
        &mut self,
        next_state: S,
        flow_type: impl Into<String>,
        args: Payload,
        limits: ResourceLimits,
    ) {
        self.pending_calls.push(PendingCall::Flow {
            next_state: next_state.name().to_string(),
            flow_type: flow_type.into(),
            args,
            limits,
            client_id: self.flow.session_id.client_id.clone(),
        });
    }

    /// Schedule a self-directed call, optionally delayed until
    /// `start_time` (used for timers)
    ///
    /// Delivered through the same request/response path as external
    /// calls.
    pub fn call_state<S: FlowState>(
        &mut self,
        next_state: S,
        payload: Payload,
        start_time: Option<DateTime<Utc>>,
    ) {
        self.pending_calls.push(PendingCall::SelfState {
            next_state: next_state.name().to_string(),
            payload,
            start_time,
        });
    }

    /// Relay a value to the parent flow's next response slot
    ///
    /// Only meaningful for child flows; replies from parentless flows
    /// are discarded by the runtime with a warning.
    pub fn send_reply(&mut self, payload: Payload) {
        self.pending_replies.push(payload);
    }

    /// Request termination of this flow with a reason
    ///
    /// Takes effect when the handler returns: status `Error`, reason
    /// recorded, children terminated recursively.
    pub fn terminate(&mut self, reason: impl Into<String>) {
        if self.terminate_reason.is_none() {
            self.terminate_reason = Some(reason.into());
        }
    }

    /// Push the processing deadline forward and renew the pass's lease
    ///
    /// Long-running handlers call this periodically so stuck-flow
    /// detection does not terminate them mid-execution and their lease
    /// does not lapse under them. A failed renew means another worker
    /// may already own the flow; the error must be propagated so the
    /// pass aborts.
    pub async fn heartbeat(&mut self) -> Result<(), EngineError> {
        if let Some((lease, manager)) = self.lease.as_mut() {
            let renewed = manager.renew(lease, self.lease_time).await?;
            *lease = renewed;
        }
        let deadline = Utc::now() + self.lease_time;
        self.flow.heartbeat(deadline);
        self.store.save(&self.flow).await?;
        debug!(session = %self.flow.session_id, "heartbeat, deadline pushed to {deadline}");
        Ok(())
    }

    /// Load the flow's typed state struct
    ///
    /// Returns `None` if the flow has stored nothing yet.
    pub fn load_store<T: DeserializeOwned>(&self) -> Result<Option<T>, EngineError> {
        if self.flow.state_blob.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(self.flow.state_blob.clone())?))
    }

    /// Persist the flow's typed state struct
    ///
    /// The blob is saved with the flow record when the pass completes.
    pub fn save_store<T: Serialize>(&mut self, state: &T) -> Result<(), EngineError> {
        self.flow.state_blob = serde_json::to_value(state)?;
        Ok(())
    }

    // Runtime-side accessors below; handlers have no business with these.

    pub(crate) fn flow_mut(&mut self) -> &mut Flow {
        &mut self.flow
    }

    pub(crate) fn take_pending_calls(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.pending_calls)
    }

    pub(crate) fn take_pending_replies(&mut self) -> Vec<Payload> {
        std::mem::take(&mut self.pending_replies)
    }

    pub(crate) fn take_terminate_reason(&mut self) -> Option<String> {
        self.terminate_reason.take()
    }

    pub(crate) fn into_flow(self) -> Flow {
        self.flow
    }
}
