//! Per-flow execution under the flow's lease
//!
//! The runner owns the two execution paths of a flow: the synchronous
//! start path (the initial handler runs on the caller's task, and a flow
//! that issues no calls is finalized without ever being queued) and the
//! resume path (deliver every completed request, in request-id order,
//! as one ordered batch each). Handler failures are contained here; the
//! worker loop above never crashes from a single flow's failure.

use crate::{
    application::context::{FlowCtx, PendingCall},
    application::worker::WorkerEvent,
    config::EngineConfig,
    domain::flow::{ClientId, Flow, FlowId, HuntId, ParentRef, SessionId},
    domain::lease::{Lease, LeaseGuard, LeaseManager},
    domain::message::{CallTarget, Request, Response, ResponseBatch},
    domain::registry::FlowRegistry,
    domain::repository::{FlowStore, MessageQueue, TaskSink},
    types::{Payload, ResourceLimits},
    EngineError,
};
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Everything needed to start a flow
pub struct StartRequest {
    /// Remote agent the flow runs against; `None` for server-local flows
    pub client_id: Option<ClientId>,
    /// Caller-supplied flow id; generated when absent
    pub flow_id: Option<FlowId>,
    /// Registered flow type name
    pub flow_type: String,
    /// Start args, validated against the type's schema
    pub args: Payload,
    /// Who started the flow
    pub creator: Option<String>,
    /// Resource budgets for the flow
    pub limits: ResourceLimits,
    /// Parent awaiting this flow's replies
    pub parent: Option<ParentRef>,
    /// Batch-orchestration parent, opaque to the core
    pub parent_hunt: Option<HuntId>,
}

/// Result of one resume pass over a flow
pub struct ProcessOutcome {
    /// The flow record after the pass
    pub flow: Flow,
    /// Number of completed requests delivered to handlers
    pub delivered: usize,
}

/// Executes flow logic against the stores
#[derive(Clone)]
pub struct FlowRunner {
    registry: Arc<FlowRegistry>,
    flow_store: Arc<dyn FlowStore>,
    queue: Arc<dyn MessageQueue>,
    task_sink: Arc<dyn TaskSink>,
    lease_manager: Arc<dyn LeaseManager>,
    config: EngineConfig,
    events: Option<broadcast::Sender<WorkerEvent>>,
}

impl FlowRunner {
    /// Create a runner over the given collaborators
    pub fn new(
        registry: Arc<FlowRegistry>,
        flow_store: Arc<dyn FlowStore>,
        queue: Arc<dyn MessageQueue>,
        task_sink: Arc<dyn TaskSink>,
        lease_manager: Arc<dyn LeaseManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            flow_store,
            queue,
            task_sink,
            lease_manager,
            config,
            events: None,
        }
    }

    /// Emit lifecycle events on the given channel (used by the worker so
    /// tests can await deterministic checkpoints)
    pub fn with_events(mut self, events: broadcast::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }

    /// Start a flow and run its initial handler synchronously on the
    /// caller's task
    ///
    /// A flow whose initial handler issues no asynchronous calls is
    /// finalized immediately and is never queued for the worker loop.
    ///
    /// Boxed because starting a child flow recurses through here.
    pub fn start_flow<'a>(
        &'a self,
        start: StartRequest,
    ) -> BoxFuture<'a, Result<SessionId, EngineError>> {
        Box::pin(async move {
            let logic = self.registry.get(&start.flow_type)?;
            let descriptor = logic.descriptor();
            descriptor.validate_args(&start.args)?;

            let flow_id = start.flow_id.unwrap_or_else(FlowId::generate);
            let session_id = match start.client_id {
                Some(client) => SessionId::for_client(client, flow_id),
                None => SessionId::server_local(flow_id),
            };

            let mut flow = Flow::new(
                session_id.clone(),
                descriptor.name.clone(),
                descriptor.start_state.clone(),
                start.limits,
                start.creator,
            );
            if let Some(parent) = start.parent {
                flow = flow.with_parent(parent);
            }
            if let Some(hunt) = start.parent_hunt {
                flow = flow.with_hunt(hunt);
            }

            // The starter holds the flow's lease for the initial pass;
            // a notification raced in by a synchronously-completing
            // child finds the session busy and is retried later.
            let lease = self
                .lease_manager
                .try_acquire(&session_id, self.config.worker_lease())
                .await?;
            let guard = LeaseGuard::new(lease.clone(), Arc::clone(&self.lease_manager));

            // Rejection on id collision leaves no partial state behind: the
            // record is the first thing written.
            if let Err(err) = self.flow_store.create(&flow).await {
                if let Err(release) = guard.release().await {
                    warn!(session = %session_id, "lease release after rejected start failed: {release}");
                }
                return Err(err);
            }
            info!(session = %session_id, flow_type = %flow.flow_type, "flow started");

            let mut ctx = FlowCtx::new(
                flow,
                Arc::clone(&self.flow_store),
                self.config.worker_lease(),
            )
            .with_lease(lease, Arc::clone(&self.lease_manager));
            let begin = logic.begin(&mut ctx, start.args).await;
            self.settle_pass(ctx, begin).await?;
            guard.release().await?;
            Ok(session_id)
        })
    }

    /// Deliver every completed, due, undelivered request of a leased flow
    ///
    /// Requests go in ascending request-id order; each one's responses
    /// are delivered as a single batch in ascending response-id order.
    /// The caller's lease, when given, is renewed by handler heartbeats.
    pub async fn process_ready(
        &self,
        flow: Flow,
        lease: Option<&Lease>,
    ) -> Result<ProcessOutcome, EngineError> {
        let logic = self.registry.get(&flow.flow_type)?;
        let accepts_unauthenticated = logic.descriptor().accepts_unauthenticated;
        let session_id = flow.session_id.clone();

        let ready = self.queue.completed_requests(&session_id, Utc::now()).await?;
        let mut delivered = 0usize;
        let mut ctx = FlowCtx::new(
            flow,
            Arc::clone(&self.flow_store),
            self.config.worker_lease(),
        );
        if let Some(lease) = lease {
            ctx = ctx.with_lease(lease.clone(), Arc::clone(&self.lease_manager));
        }

        for (request, responses) in ready {
            if !ctx.flow().is_running() {
                // The flow died earlier in this pass; consume leftovers.
                self.queue
                    .delete_request(&session_id, request.request_id)
                    .await?;
                continue;
            }

            // Unauthenticated fragments never reach a handler and never
            // complete a request on their own.
            let acceptable: Vec<Response> = responses
                .into_iter()
                .filter(|r| {
                    r.auth == crate::domain::message::AuthState::Authenticated
                        || accepts_unauthenticated
                })
                .collect();
            if !acceptable.iter().any(Response::is_status) {
                debug!(
                    session = %session_id,
                    request = request.request_id.0,
                    "completion marker without an acceptable status, leaving request pending"
                );
                continue;
            }

            let batch = ResponseBatch::assemble(acceptable)?;
            ctx.flow_mut().request_completed();

            if let Some(usage) = batch.reported_usage() {
                if let Err(breach) = ctx.flow_mut().accrue_usage(&usage) {
                    warn!(session = %session_id, "resource budget breached: {breach}");
                    self.queue
                        .delete_request(&session_id, request.request_id)
                        .await?;
                    let flow = ctx.into_flow();
                    let flow = self.force_error(flow, breach.to_string()).await?;
                    return Ok(ProcessOutcome { flow, delivered });
                }
            }

            self.emit(WorkerEvent::HandlerEntered {
                session_id: session_id.clone(),
                state: request.next_state.clone(),
            });
            let result = logic.resume(&mut ctx, &request.next_state, batch).await;
            self.queue
                .delete_request(&session_id, request.request_id)
                .await?;
            delivered += 1;

            match result {
                Ok(()) => {
                    ctx.flow_mut().current_state = request.next_state.clone();
                    if let Some(reason) = ctx.take_terminate_reason() {
                        let flow = ctx.into_flow();
                        let flow = self.force_error(flow, reason).await?;
                        return Ok(ProcessOutcome { flow, delivered });
                    }
                    if let Err(flush) = self.flush_calls(&mut ctx).await {
                        // A call that cannot be issued fails the flow;
                        // leaving it suspended would wait forever.
                        error!(session = %session_id, "issuing calls failed: {flush}");
                        let flow = ctx.into_flow();
                        let flow = self.force_error(flow, flush.to_string()).await?;
                        return Ok(ProcessOutcome { flow, delivered });
                    }
                    self.flush_replies(&mut ctx).await?;
                }
                Err(failure) => {
                    error!(session = %session_id, state = %request.next_state, "flow handler failed: {failure}");
                    let flow = ctx.into_flow();
                    let flow = self.force_error(flow, failure.to_string()).await?;
                    return Ok(ProcessOutcome { flow, delivered });
                }
            }
        }

        let flow = self.finish_pass(ctx).await?;
        Ok(ProcessOutcome { flow, delivered })
    }

    /// Terminate a flow and its children with a reason
    pub async fn terminate_flow(
        &self,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let flow = self
            .flow_store
            .find(session_id)
            .await?
            .ok_or_else(|| EngineError::UnknownFlow(session_id.to_string()))?;
        if !flow.is_running() {
            debug!(session = %session_id, "terminate on finished flow is a no-op");
            return Ok(());
        }
        self.force_error(flow, reason.to_string()).await?;
        Ok(())
    }

    /// Settle a start pass: handle the begin result, flush buffered
    /// work, finalize or suspend
    async fn settle_pass(
        &self,
        mut ctx: FlowCtx,
        begin: Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        match begin {
            Ok(()) => {
                if let Some(reason) = ctx.take_terminate_reason() {
                    let flow = ctx.into_flow();
                    self.force_error(flow, reason).await?;
                    return Ok(());
                }
                if let Err(flush) = self.flush_calls(&mut ctx).await {
                    error!(session = %ctx.session_id(), "issuing calls failed: {flush}");
                    let flow = ctx.into_flow();
                    self.force_error(flow, flush.to_string()).await?;
                    return Ok(());
                }
                self.flush_replies(&mut ctx).await?;
                self.finish_pass(ctx).await?;
                Ok(())
            }
            Err(failure) => {
                error!(session = %ctx.session_id(), "initial handler failed: {failure}");
                let flow = ctx.into_flow();
                self.force_error(flow, failure.to_string()).await?;
                Ok(())
            }
        }
    }

    /// Persist the flow at its suspension point, or finalize it when
    /// nothing is outstanding
    async fn finish_pass(&self, mut ctx: FlowCtx) -> Result<Flow, EngineError> {
        if ctx.flow().is_running() && ctx.flow().outstanding_requests == 0 {
            let replies = ctx.take_pending_replies();
            debug_assert!(replies.is_empty(), "replies are flushed before finalize");
            ctx.flow_mut().mark_terminated()?;
            let mut flow = ctx.into_flow();
            flow.finish_processing();
            self.flow_store.save(&flow).await?;
            info!(session = %flow.session_id, "flow terminated cleanly");
            self.notify_parent(&flow, Ok(())).await?;
            return Ok(flow);
        }
        let flow = ctx.into_flow();
        self.flow_store.save(&flow).await?;
        debug!(
            session = %flow.session_id,
            outstanding = flow.outstanding_requests,
            "flow suspended"
        );
        Ok(flow)
    }

    /// Put a flow into `Error` state: record the reason, clean up its
    /// messages and notification, terminate its children, tell the
    /// parent
    fn force_error<'a>(
        &'a self,
        mut flow: Flow,
        reason: String,
    ) -> BoxFuture<'a, Result<Flow, EngineError>> {
        Box::pin(async move {
            flow.mark_error(reason.clone());
            flow.finish_processing();
            self.flow_store.save(&flow).await?;
            self.queue.delete_session_messages(&flow.session_id).await?;
            self.queue.delete_notification(&flow.session_id).await?;
            info!(session = %flow.session_id, "flow terminated: {reason}");

            for child in flow.children.clone() {
                match self.flow_store.find(&child).await? {
                    Some(child_flow) if child_flow.is_running() => {
                        let child_reason =
                            format!("parent flow {} terminated: {}", flow.session_id, reason);
                        self.force_error(child_flow, child_reason).await?;
                    }
                    _ => {}
                }
            }

            self.notify_parent(&flow, Err(reason)).await?;
            Ok(flow)
        })
    }

    /// Deliver a terminal status to the parent's awaiting request
    async fn notify_parent(
        &self,
        flow: &Flow,
        outcome: Result<(), String>,
    ) -> Result<(), EngineError> {
        let Some(parent) = &flow.parent else {
            return Ok(());
        };
        let payload = match &outcome {
            Ok(()) => Payload::new(json!({ "status": "ok" })),
            Err(reason) => Payload::new(json!({ "status": "error", "reason": reason })),
        };
        // Reply ids continue the child's sequence so the status sorts
        // after every send_reply fragment.
        let status = Response::status(
            parent.session_id.clone(),
            parent.request_id,
            crate::domain::flow::ResponseId(flow.next_reply_id),
            payload,
        )
        .with_usage(flow.usage);
        self.queue
            .write_responses(&parent.session_id, vec![status], None)
            .await?;
        Ok(())
    }

    /// Write buffered replies as ordered data responses on the parent's
    /// awaiting request
    async fn flush_replies(&self, ctx: &mut FlowCtx) -> Result<(), EngineError> {
        let replies = ctx.take_pending_replies();
        if replies.is_empty() {
            return Ok(());
        }
        let Some(parent) = ctx.flow().parent.clone() else {
            warn!(session = %ctx.session_id(), "send_reply from a parentless flow, discarding");
            return Ok(());
        };
        let mut responses = Vec::with_capacity(replies.len());
        for payload in replies {
            let reply_id = ctx.flow_mut().allocate_reply_id();
            responses.push(Response::data(
                parent.session_id.clone(),
                parent.request_id,
                crate::domain::flow::ResponseId(reply_id.0),
                payload,
            ));
        }
        // Data only: the parent's request stays incomplete until this
        // child's terminal status arrives.
        self.queue
            .write_responses(&parent.session_id, responses, None)
            .await?;
        Ok(())
    }

    /// Turn buffered calls into requests, tasks and child flows
    async fn flush_calls(&self, ctx: &mut FlowCtx) -> Result<(), EngineError> {
        for call in ctx.take_pending_calls() {
            match call {
                PendingCall::Client {
                    next_state,
                    payload,
                    limits,
                } => {
                    let client_id = ctx.client_id().cloned().ok_or_else(|| {
                        EngineError::FlowFailed(
                            "call_client from a flow with no client".to_string(),
                        )
                    })?;
                    let session_id = ctx.session_id().clone();
                    let request_id = ctx.flow_mut().allocate_request_id();
                    let task_id = self
                        .task_sink
                        .send_task(&client_id, &session_id, request_id, &payload)
                        .await?;
                    self.queue
                        .write_request(&Request {
                            session_id,
                            request_id,
                            next_state,
                            target: CallTarget::Client { task_id },
                            limits,
                            issued_at: Utc::now(),
                        })
                        .await?;
                }
                PendingCall::Flow {
                    next_state,
                    flow_type,
                    args,
                    limits,
                    client_id,
                } => {
                    let session_id = ctx.session_id().clone();
                    let request_id = ctx.flow_mut().allocate_request_id();
                    let child_flow_id = FlowId::generate();
                    let child_session = match &client_id {
                        Some(client) => {
                            SessionId::for_client(client.clone(), child_flow_id.clone())
                        }
                        None => SessionId::server_local(child_flow_id.clone()),
                    };
                    // The request row goes in before the child starts: a
                    // child that completes synchronously writes its
                    // status to this request from inside start_flow.
                    self.queue
                        .write_request(&Request {
                            session_id: session_id.clone(),
                            request_id,
                            next_state,
                            target: CallTarget::ChildFlow {
                                session_id: child_session.clone(),
                            },
                            limits,
                            issued_at: Utc::now(),
                        })
                        .await?;
                    ctx.flow_mut().add_child(child_session);
                    self.start_flow(StartRequest {
                        client_id,
                        flow_id: Some(child_flow_id),
                        flow_type,
                        args,
                        creator: Some(format!("flow {session_id}")),
                        limits,
                        parent: Some(ParentRef {
                            session_id,
                            request_id,
                        }),
                        parent_hunt: ctx.flow().parent_hunt.clone(),
                    })
                    .await?;
                }
                PendingCall::SelfState {
                    next_state,
                    payload,
                    start_time,
                } => {
                    let session_id = ctx.session_id().clone();
                    let request_id = ctx.flow_mut().allocate_request_id();
                    self.queue
                        .write_request(&Request {
                            session_id: session_id.clone(),
                            request_id,
                            next_state,
                            target: CallTarget::SelfState { start_time },
                            limits: ctx.flow().limits,
                            issued_at: Utc::now(),
                        })
                        .await?;
                    // A self call answers itself: the payload and the
                    // completing status are written up front, and the
                    // notification is held back until start_time.
                    let mut responses = Vec::new();
                    let mut next_id = 1u64;
                    if !payload.is_empty() {
                        responses.push(Response::data(
                            session_id.clone(),
                            request_id,
                            crate::domain::flow::ResponseId(next_id),
                            payload,
                        ));
                        next_id += 1;
                    }
                    responses.push(Response::status(
                        session_id.clone(),
                        request_id,
                        crate::domain::flow::ResponseId(next_id),
                        Payload::new(json!({ "status": "ok" })),
                    ));
                    self.queue
                        .write_responses(&session_id, responses, start_time)
                        .await?;
                }
            }
        }
        Ok(())
    }
}
