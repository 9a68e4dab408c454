//! In-memory flow store, message queue and task sink

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use fleetflow_core::{
    ClientId, EngineError, Flow, FlowStatus, FlowStore, MessageQueue, Notification, Payload,
    Request, RequestId, Response, SessionId, TaskSink,
};

/// Flow records in a concurrent map keyed by session id
#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: DashMap<String, Flow>,
}

impl InMemoryFlowStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn find(&self, session_id: &SessionId) -> Result<Option<Flow>, EngineError> {
        Ok(self.flows.get(&session_id.to_string()).map(|f| f.clone()))
    }

    async fn create(&self, flow: &Flow) -> Result<(), EngineError> {
        match self.flows.entry(flow.session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::FlowAlreadyExists(
                flow.session_id.to_string(),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(flow.clone());
                Ok(())
            }
        }
    }

    async fn save(&self, flow: &Flow) -> Result<(), EngineError> {
        self.flows
            .insert(flow.session_id.to_string(), flow.clone());
        Ok(())
    }

    async fn list(
        &self,
        client_id: Option<&ClientId>,
        status: Option<FlowStatus>,
    ) -> Result<Vec<Flow>, EngineError> {
        let mut flows: Vec<Flow> = self
            .flows
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|flow| {
                client_id.map_or(true, |c| flow.session_id.client_id.as_ref() == Some(c))
                    && status.map_or(true, |s| flow.status == s)
            })
            .collect();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(flows)
    }
}

/// Mailbox contents of one session
#[derive(Default)]
struct SessionMailbox {
    /// Undelivered requests by request id
    requests: BTreeMap<u64, Request>,
    /// Response fragments by request id, in arrival order
    responses: BTreeMap<u64, Vec<Response>>,
    /// Completed request ids mapped to the time they become readable
    completed: BTreeMap<u64, DateTime<Utc>>,
}

/// Queue state guarded by one lock so each write is a single atomic step
#[derive(Default)]
struct QueueState {
    mailboxes: HashMap<String, SessionMailbox>,
    notifications: HashMap<String, Notification>,
}

/// In-memory message queue and notification queue
///
/// A whole `write_responses` call happens under one lock: the rows, the
/// completion markers and the derived notification become visible
/// together, so a reader can never observe a completed request whose
/// data it cannot read.
#[derive(Default)]
pub struct InMemoryMessageQueue {
    state: RwLock<QueueState>,
}

impl InMemoryMessageQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending notifications, due or not (test observability)
    pub async fn notification_count(&self) -> usize {
        self.state.read().await.notifications.len()
    }
}

fn collapse_notification(
    notifications: &mut HashMap<String, Notification>,
    notification: Notification,
) {
    match notifications.entry(notification.session_id.to_string()) {
        std::collections::hash_map::Entry::Occupied(mut slot) => {
            let existing = slot.get_mut();
            // Merge keeps the earliest first_queued and highest
            // priority; delivery moves up if the new notification is
            // due sooner.
            if notification.deliver_after < existing.deliver_after {
                existing.deliver_after = notification.deliver_after;
            }
            existing.merge(&notification);
        }
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(notification);
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn write_request(&self, request: &Request) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        let mailbox = state
            .mailboxes
            .entry(request.session_id.to_string())
            .or_default();
        trace!(
            session = %request.session_id,
            request = request.request_id.0,
            "request written"
        );
        mailbox
            .requests
            .insert(request.request_id.0, request.clone());
        Ok(())
    }

    async fn write_responses(
        &self,
        session_id: &SessionId,
        responses: Vec<Response>,
        deliver_after: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        if responses.is_empty() {
            return Ok(());
        }
        let frozen = Utc::now();
        let priority = responses
            .iter()
            .map(|r| r.priority)
            .max()
            .unwrap_or_default();
        let mut completed: Vec<RequestId> = Vec::new();

        let mut state = self.state.write().await;
        let mailbox = state.mailboxes.entry(session_id.to_string()).or_default();
        let ready_at = deliver_after.unwrap_or(frozen);
        for mut response in responses {
            response.timestamp = frozen;
            if response.is_status() {
                mailbox.completed.insert(response.request_id.0, ready_at);
                completed.push(response.request_id);
            }
            mailbox
                .responses
                .entry(response.request_id.0)
                .or_default()
                .push(response);
        }

        if let Some(last_status) = completed.last().copied() {
            let mut notification =
                Notification::new(session_id.clone(), priority, Some(last_status));
            if let Some(after) = deliver_after {
                notification.deliver_after = after;
            }
            debug!(
                session = %session_id,
                completed = completed.len(),
                "responses completed requests, notification queued"
            );
            collapse_notification(&mut state.notifications, notification);
        }
        Ok(())
    }

    async fn completed_requests(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Request, Vec<Response>)>, EngineError> {
        let state = self.state.read().await;
        let Some(mailbox) = state.mailboxes.get(&session_id.to_string()) else {
            return Ok(Vec::new());
        };
        Ok(mailbox
            .requests
            .iter()
            .filter(|(id, _)| mailbox.completed.get(*id).map_or(false, |ready| *ready <= now))
            .map(|(id, request)| {
                let responses = mailbox.responses.get(id).cloned().unwrap_or_default();
                (request.clone(), responses)
            })
            .collect())
    }

    async fn delete_request(
        &self,
        session_id: &SessionId,
        request_id: RequestId,
    ) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        if let Some(mailbox) = state.mailboxes.get_mut(&session_id.to_string()) {
            mailbox.requests.remove(&request_id.0);
            mailbox.responses.remove(&request_id.0);
            mailbox.completed.remove(&request_id.0);
        }
        Ok(())
    }

    async fn delete_session_messages(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        state.mailboxes.remove(&session_id.to_string());
        Ok(())
    }

    async fn queue_notification(&self, notification: Notification) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        collapse_notification(&mut state.notifications, notification);
        Ok(())
    }

    async fn fetch_notifications(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Notification>, EngineError> {
        let state = self.state.read().await;
        let mut due: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.is_due(now))
            .cloned()
            .collect();
        // Highest priority first; ties go to the longest-waiting flow.
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.first_queued.cmp(&b.first_queued))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_notification(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        state.notifications.remove(&session_id.to_string());
        Ok(())
    }
}

/// A task handed to a client, as recorded by [`InMemoryTaskSink`]
#[derive(Debug, Clone)]
pub struct SentTask {
    /// Ticket returned to the caller
    pub task_id: String,
    /// Receiving client
    pub client_id: ClientId,
    /// Session the eventual responses belong to
    pub session_id: SessionId,
    /// Request awaiting the responses
    pub request_id: RequestId,
    /// Task payload
    pub payload: Payload,
}

/// Task sink that records outbound tasks instead of delivering them
///
/// Tests pop recorded tasks and inject whatever responses the scenario
/// calls for.
#[derive(Default)]
pub struct InMemoryTaskSink {
    sent: RwLock<Vec<SentTask>>,
}

impl InMemoryTaskSink {
    /// Create an empty sink
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every task sent so far, in send order
    pub async fn sent(&self) -> Vec<SentTask> {
        self.sent.read().await.clone()
    }

    /// Recorded tasks for one session
    pub async fn sent_for(&self, session_id: &SessionId) -> Vec<SentTask> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|t| &t.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskSink for InMemoryTaskSink {
    async fn send_task(
        &self,
        client_id: &ClientId,
        session_id: &SessionId,
        request_id: RequestId,
        payload: &Payload,
    ) -> Result<String, EngineError> {
        let task_id = format!("T:{}", Uuid::new_v4().simple());
        self.sent.write().await.push(SentTask {
            task_id: task_id.clone(),
            client_id: client_id.clone(),
            session_id: session_id.clone(),
            request_id,
            payload: payload.clone(),
        });
        Ok(task_id)
    }
}
