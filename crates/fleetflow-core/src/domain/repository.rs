//! Persistence and transport contracts for the engine
//!
//! These traits are the engine's view of its external collaborators: an
//! ordered, versioned key/value capability for flows, requests, responses
//! and notifications, and a task-send primitive for remote agents.
//! Backend crates implement them; `fleetflow-state-inmemory` provides the
//! in-memory implementations used by tests and embedded deployments.

use crate::{
    domain::flow::{ClientId, Flow, FlowStatus, RequestId, SessionId},
    domain::message::{Notification, Request, Response},
    types::Payload,
    EngineError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Store for flow records
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Find a flow by session
    async fn find(&self, session_id: &SessionId) -> Result<Option<Flow>, EngineError>;

    /// Create a new flow record
    ///
    /// Fails with `FlowAlreadyExists` if the session is taken; no partial
    /// state may be left behind on failure.
    async fn create(&self, flow: &Flow) -> Result<(), EngineError>;

    /// Persist an updated flow record
    async fn save(&self, flow: &Flow) -> Result<(), EngineError>;

    /// List flows, optionally filtered by owning client and status
    async fn list(
        &self,
        client_id: Option<&ClientId>,
        status: Option<FlowStatus>,
    ) -> Result<Vec<Flow>, EngineError>;
}

/// Durable mailboxes for requests and responses plus the notification
/// queue that wakes suspended flows
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Record an issued request
    async fn write_request(&self, request: &Request) -> Result<(), EngineError>;

    /// Append response fragments as one logical queueing operation
    ///
    /// All rows of one call share a single frozen timestamp. If the batch
    /// contains a `Status`, the implementation must mark the request
    /// complete and queue a notification, and must do so only once the
    /// rows are durably readable: a worker must never observe "complete"
    /// without being able to read the triggering data.
    ///
    /// `deliver_after` delays both the derived notification and the
    /// request's readability; delayed self-directed calls (timers) use
    /// it.
    async fn write_responses(
        &self,
        session_id: &SessionId,
        responses: Vec<Response>,
        deliver_after: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError>;

    /// Requests whose completion marker is set, that are due at `now`,
    /// and that have not yet been delivered, ascending request id, each
    /// with all of its responses
    ///
    /// A request completed with a `deliver_after` in the future must not
    /// appear before that time, no matter what else completes on the
    /// session in the meantime.
    async fn completed_requests(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Request, Vec<Response>)>, EngineError>;

    /// Consume a delivered request and its responses
    async fn delete_request(
        &self,
        session_id: &SessionId,
        request_id: RequestId,
    ) -> Result<(), EngineError>;

    /// Delete every request and response of a session (used when a flow
    /// is forcibly terminated)
    async fn delete_session_messages(&self, session_id: &SessionId) -> Result<(), EngineError>;

    /// Queue a wake-up notification
    ///
    /// A pending notification for the same session collapses with the new
    /// one (earliest `first_queued`, highest priority).
    async fn queue_notification(&self, notification: Notification) -> Result<(), EngineError>;

    /// Fetch due notifications, highest priority first
    ///
    /// Only notifications with `deliver_after <= now` are returned. Order
    /// within one priority tier is unspecified.
    async fn fetch_notifications(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Notification>, EngineError>;

    /// Delete the pending notification for a session
    async fn delete_notification(&self, session_id: &SessionId) -> Result<(), EngineError>;
}

/// Transport collaborator: enqueue work for remote agents
///
/// Inbound agent replies do not pass through this trait; the transport
/// layer validates them and hands them to the engine as responses.
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Enqueue a payload for a remote agent, returning the transport's
    /// task id
    async fn send_task(
        &self,
        client_id: &ClientId,
        session_id: &SessionId,
        request_id: RequestId,
        payload: &Payload,
    ) -> Result<String, EngineError>;
}
