//! The request/response protocol data model
//!
//! A flow issues a `Request` for each asynchronous call it makes. Replies
//! arrive as `Response` fragments in any order; the request is complete
//! only once a `Status` response exists for it, at which point the data
//! fragments are sorted ascending by response id and delivered as one
//! ordered `ResponseBatch`. A `Notification` is the wake-up signal that a
//! session has completed work ready for processing.

use crate::{
    domain::flow::{RequestId, ResponseId, SessionId},
    types::{Payload, Priority, ResourceLimits, ResourceUsage},
    EngineError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a request's work is performed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallTarget {
    /// A task queued for the remote agent owning this session
    Client {
        /// Transport-assigned task id
        task_id: String,
    },
    /// A child flow whose replies complete this request
    ChildFlow {
        /// The child's session
        session_id: SessionId,
    },
    /// A self-directed call, optionally delayed (used for timers)
    SelfState {
        /// Earliest time the completion may be delivered
        start_time: Option<DateTime<Utc>>,
    },
}

/// One outstanding asynchronous call issued by a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Session the request belongs to
    pub session_id: SessionId,

    /// Monotonically increasing per-flow id
    pub request_id: RequestId,

    /// Serialized name of the handler to invoke on completion
    pub next_state: String,

    /// Where the work is performed
    pub target: CallTarget,

    /// Snapshot of the resource limits in effect when issued
    pub limits: ResourceLimits,

    /// When the request was issued
    pub issued_at: DateTime<Utc>,
}

impl Request {
    /// Earliest time this request's completion may be delivered, if the
    /// target carries one (delayed self-directed calls)
    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        match &self.target {
            CallTarget::SelfState { start_time } => *start_time,
            _ => None,
        }
    }
}

/// Kind of a response fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// A data fragment
    Data,
    /// The terminal reply that marks the request complete
    Status,
    /// A fragment describing a continuable iteration
    Iterator,
}

/// Authentication state of a response, decided by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    /// The sender's identity was verified
    Authenticated,
    /// The sender's identity was not verified; accepted only by flow
    /// types explicitly marked for agent-originated traffic
    Unauthenticated,
}

/// One reply fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Session the response belongs to
    pub session_id: SessionId,

    /// The request this response answers
    pub request_id: RequestId,

    /// Unique per request; delivery order is ascending response id
    pub response_id: ResponseId,

    /// Kind of fragment
    pub kind: ResponseKind,

    /// Whether the sender's identity was verified
    pub auth: AuthState,

    /// Priority the completing notification inherits
    pub priority: Priority,

    /// The carried value
    pub payload: Payload,

    /// Resource usage reported with this fragment, if any (agents report
    /// usage on the Status)
    pub usage: Option<ResourceUsage>,

    /// When the queue accepted the response
    pub timestamp: DateTime<Utc>,
}

impl Response {
    /// Build an authenticated data fragment
    pub fn data(
        session_id: SessionId,
        request_id: RequestId,
        response_id: ResponseId,
        payload: Payload,
    ) -> Self {
        Self {
            session_id,
            request_id,
            response_id,
            kind: ResponseKind::Data,
            auth: AuthState::Authenticated,
            priority: Priority::Medium,
            payload,
            usage: None,
            timestamp: Utc::now(),
        }
    }

    /// Build an authenticated terminal status
    pub fn status(
        session_id: SessionId,
        request_id: RequestId,
        response_id: ResponseId,
        payload: Payload,
    ) -> Self {
        Self {
            session_id,
            request_id,
            response_id,
            kind: ResponseKind::Status,
            auth: AuthState::Authenticated,
            priority: Priority::Medium,
            payload,
            usage: None,
            timestamp: Utc::now(),
        }
    }

    /// Mark the response as unauthenticated
    pub fn unauthenticated(mut self) -> Self {
        self.auth = AuthState::Unauthenticated;
        self
    }

    /// Set the priority the completing notification inherits
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a usage report
    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Whether this is the terminal status fragment
    #[inline]
    pub fn is_status(&self) -> bool {
        self.kind == ResponseKind::Status
    }
}

/// The ordered unit delivered to a flow handler
///
/// Data and iterator fragments sorted ascending by response id, followed
/// by the status. Arrival order is irrelevant by construction.
#[derive(Debug, Clone)]
pub struct ResponseBatch {
    /// Data/iterator fragments, ascending response id
    pub responses: Vec<Response>,

    /// The terminal status
    pub status: Response,
}

impl ResponseBatch {
    /// Assemble a batch from responses in arbitrary arrival order
    ///
    /// Fails if no status fragment is present: an incomplete request has
    /// no batch.
    pub fn assemble(mut responses: Vec<Response>) -> Result<Self, EngineError> {
        responses.sort_by_key(|r| r.response_id);
        let status_pos = responses
            .iter()
            .position(Response::is_status)
            .ok_or_else(|| {
                EngineError::StateStoreError(
                    "cannot assemble a batch without a status response".to_string(),
                )
            })?;
        let status = responses.remove(status_pos);
        Ok(Self { responses, status })
    }

    /// The usage reported with this batch, if any
    pub fn reported_usage(&self) -> Option<ResourceUsage> {
        self.status.usage
    }

    /// Payloads of the data fragments, in delivery order
    pub fn payloads(&self) -> impl Iterator<Item = &Payload> {
        self.responses.iter().map(|r| &r.payload)
    }
}

/// A wake-up signal: a session has completed work ready for processing
///
/// Notifications are idempotent; re-delivery of an already-processed one
/// finds nothing to deliver (enforced by the request completion markers,
/// not by the notification itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Session with ready work
    pub session_id: SessionId,

    /// Drain priority, derived from the triggering message
    pub priority: Priority,

    /// When this notification was queued
    pub timestamp: DateTime<Utc>,

    /// Earliest time any notification was queued for this session,
    /// preserved across re-queues
    pub first_queued: DateTime<Utc>,

    /// Do not deliver before this time; used to re-queue with a minimum
    /// delay when a notification outruns its data
    pub deliver_after: DateTime<Utc>,

    /// The request completed by the triggering status, if known
    pub last_status: Option<RequestId>,
}

impl Notification {
    /// Build a notification deliverable immediately
    pub fn new(session_id: SessionId, priority: Priority, last_status: Option<RequestId>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            priority,
            timestamp: now,
            first_queued: now,
            deliver_after: now,
            last_status,
        }
    }

    /// Collapse another pending notification for the same session into
    /// this one: keep the earliest `first_queued` and the highest
    /// priority, so redundant notifications have one observable effect.
    pub fn merge(&mut self, other: &Notification) {
        debug_assert_eq!(self.session_id, other.session_id);
        if other.first_queued < self.first_queued {
            self.first_queued = other.first_queued;
        }
        if other.priority > self.priority {
            self.priority = other.priority;
        }
        if self.last_status.is_none() {
            self.last_status = other.last_status;
        }
    }

    /// Derive the re-queued copy of this notification
    ///
    /// `first_queued` is preserved; only the delivery time moves.
    pub fn requeued(&self, delay: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: self.session_id.clone(),
            priority: self.priority,
            timestamp: now,
            first_queued: self.first_queued,
            deliver_after: now + delay,
            last_status: self.last_status,
        }
    }

    /// Whether the notification may be delivered at `now`
    #[inline]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.deliver_after <= now
    }
}
