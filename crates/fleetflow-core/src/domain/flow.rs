use crate::{
    types::{ResourceLimits, ResourceUsage},
    EngineError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Value object: id of the remote agent that owns a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

/// Value object: unique flow id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl FlowId {
    /// Generate a fresh flow id
    pub fn generate() -> Self {
        FlowId(format!("F:{}", Uuid::new_v4().simple()))
    }
}

/// Value object: id of the batch-orchestration parent, opaque to the core
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HuntId(pub String);

/// Value object: identity of a worker process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

/// Value object: per-flow monotonically increasing request id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Value object: per-request response id; delivery order is ascending
/// response id, never arrival order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResponseId(pub u64);

/// The key scoping all requests, responses, notifications and leases of
/// one flow
///
/// Server-local flows have no client id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    /// Owning remote agent, absent for server-local flows
    pub client_id: Option<ClientId>,
    /// The flow id
    pub flow_id: FlowId,
}

impl SessionId {
    /// Session of a flow running against a remote agent
    pub fn for_client(client_id: ClientId, flow_id: FlowId) -> Self {
        Self {
            client_id: Some(client_id),
            flow_id,
        }
    }

    /// Session of a server-local flow
    pub fn server_local(flow_id: FlowId) -> Self {
        Self {
            client_id: None,
            flow_id,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.client_id {
            Some(client) => write!(f, "{}/{}", client.0, self.flow_id.0),
            None => write!(f, "{}", self.flow_id.0),
        }
    }
}

/// A flow's link to the parent that awaits its replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    /// The parent flow's session
    pub session_id: SessionId,
    /// The request in the parent that this child completes
    pub request_id: RequestId,
}

/// Flow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    /// Flow can still process responses
    Running,

    /// Flow ended with an error (failure, resource breach, explicit or
    /// forced termination)
    Error,

    /// Flow ran its terminal handler with nothing outstanding
    Terminated,
}

/// Aggregate: one resumable unit of work
///
/// The record is durable; it is mutated only by the worker holding the
/// flow's lease. Children are referenced by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// The session scoping all of this flow's messages
    pub session_id: SessionId,

    /// Registered flow type name
    pub flow_type: String,

    /// Parent flow awaiting this flow's replies, if any
    pub parent: Option<ParentRef>,

    /// Batch-orchestration parent, if any; opaque to the core
    pub parent_hunt: Option<HuntId>,

    /// Serialized name of the next handler to run
    pub current_state: String,

    /// Next request id to allocate
    pub next_request_id: u64,

    /// Next response id for replies sent to the parent
    pub next_reply_id: u64,

    /// Number of issued requests not yet delivered
    pub outstanding_requests: u64,

    /// Current status
    pub status: FlowStatus,

    /// Termination or failure reason, queryable after the fact
    pub error: Option<String>,

    /// Cumulative reported usage
    pub usage: ResourceUsage,

    /// Budgets `usage` is checked against
    pub limits: ResourceLimits,

    /// Child flows started by this flow, ids only (no ownership)
    pub children: Vec<SessionId>,

    /// Worker currently processing this flow
    pub processing_on: Option<WorkerId>,

    /// When the current processing pass began
    pub processing_since: Option<DateTime<Utc>>,

    /// Deadline the current processing pass must heartbeat before
    pub processing_deadline: Option<DateTime<Utc>>,

    /// Typed per-flow state blob, owned exclusively by this flow
    pub state_blob: serde_json::Value,

    /// Who started the flow
    pub creator: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Create a new flow record in `Running` state
    pub fn new(
        session_id: SessionId,
        flow_type: impl Into<String>,
        start_state: impl Into<String>,
        limits: ResourceLimits,
        creator: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            flow_type: flow_type.into(),
            parent: None,
            parent_hunt: None,
            current_state: start_state.into(),
            next_request_id: 1,
            next_reply_id: 1,
            outstanding_requests: 0,
            status: FlowStatus::Running,
            error: None,
            usage: ResourceUsage::default(),
            limits,
            children: Vec::new(),
            processing_on: None,
            processing_since: None,
            processing_deadline: None,
            state_blob: serde_json::Value::Null,
            creator,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach this flow to a parent awaiting its replies
    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Attach this flow to a batch-orchestration parent
    pub fn with_hunt(mut self, hunt_id: HuntId) -> Self {
        self.parent_hunt = Some(hunt_id);
        self
    }

    /// Whether the flow can still process responses
    #[inline]
    pub fn is_running(&self) -> bool {
        self.status == FlowStatus::Running
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Allocate the next request id and count it as outstanding
    pub fn allocate_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        self.outstanding_requests += 1;
        self.touch();
        id
    }

    /// Allocate the next response id for a reply to the parent
    pub fn allocate_reply_id(&mut self) -> ResponseId {
        let id = ResponseId(self.next_reply_id);
        self.next_reply_id += 1;
        id
    }

    /// Record that one outstanding request was delivered
    pub fn request_completed(&mut self) {
        self.outstanding_requests = self.outstanding_requests.saturating_sub(1);
        self.touch();
    }

    /// Remember a started child, id only
    pub fn add_child(&mut self, child: SessionId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    /// Accumulate a usage report and check it against the budgets
    ///
    /// A breach returns a `ResourceExceeded` error naming the budget; the
    /// caller is expected to treat it as a forced termination.
    pub fn accrue_usage(&mut self, report: &ResourceUsage) -> Result<(), EngineError> {
        self.usage.add(report);
        self.touch();
        if let Some(budget) = self.limits.check(&self.usage) {
            let detail = match budget {
                "cpu" => format!("{:.2}s used", self.usage.cpu_seconds),
                "network" => format!("{} bytes used", self.usage.network_bytes),
                _ => format!("{:.2}s elapsed", self.usage.runtime_seconds),
            };
            return Err(EngineError::resource_exceeded(budget, detail));
        }
        Ok(())
    }

    /// Finish the flow successfully
    ///
    /// Only legal with zero outstanding requests; a flow never reaches
    /// `Terminated` with a pending, undelivered request.
    pub fn mark_terminated(&mut self) -> Result<(), EngineError> {
        if self.status != FlowStatus::Running {
            return Err(EngineError::FlowFailed(format!(
                "cannot terminate flow in state {:?}",
                self.status
            )));
        }
        if self.outstanding_requests != 0 {
            return Err(EngineError::FlowFailed(format!(
                "cannot terminate flow {} with {} outstanding requests",
                self.session_id, self.outstanding_requests
            )));
        }
        self.status = FlowStatus::Terminated;
        self.touch();
        Ok(())
    }

    /// Put the flow into `Error` state with a reason
    ///
    /// Idempotent once the flow is no longer running: the first recorded
    /// reason wins.
    pub fn mark_error(&mut self, reason: impl Into<String>) {
        if self.status == FlowStatus::Running {
            self.status = FlowStatus::Error;
            self.error = Some(reason.into());
            self.touch();
        }
    }

    /// Record that a worker began processing this flow
    pub fn begin_processing(&mut self, worker: WorkerId, deadline: DateTime<Utc>) {
        self.processing_on = Some(worker);
        self.processing_since = Some(Utc::now());
        self.processing_deadline = Some(deadline);
        self.touch();
    }

    /// Push the processing deadline forward
    ///
    /// Exposed to long-running handlers through the flow context so they
    /// are not falsely detected as stuck.
    pub fn heartbeat(&mut self, deadline: DateTime<Utc>) {
        self.processing_deadline = Some(deadline);
        self.touch();
    }

    /// Clear the processing fields after a pass completes
    pub fn finish_processing(&mut self) {
        self.processing_on = None;
        self.processing_since = None;
        self.processing_deadline = None;
        self.touch();
    }

    /// Whether a processing pass is past its deadline without a heartbeat
    pub fn is_stuck(&self, now: DateTime<Utc>) -> bool {
        match (self.processing_since, self.processing_deadline) {
            (Some(_), Some(deadline)) => now > deadline,
            _ => false,
        }
    }
}
