//! Shared fixtures: an engine/worker harness over the in-memory stores
//! and a handful of small flow types.

// Not every test binary exercises every fixture.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use fleetflow_core::{
    ClientId, EngineConfig, EngineError, FlowCtx, FlowDescriptor, FlowEngine, FlowId, FlowLogic,
    FlowRegistry, FlowState, Payload, ResourceLimits, Response, ResponseBatch, SessionId,
    StartRequest, WellKnownFlow, Worker, WorkerConfig,
};
use fleetflow_state_inmemory::InMemoryStateStore;

pub struct Harness {
    pub stores: InMemoryStateStore,
    pub engine: FlowEngine,
    pub worker: Worker,
}

/// Wire an engine and a single worker over fresh in-memory stores
pub fn harness(configure: impl FnOnce(&mut FlowRegistry)) -> Harness {
    harness_with(configure, EngineConfig::default(), WorkerConfig::default())
}

pub fn harness_with(
    configure: impl FnOnce(&mut FlowRegistry),
    config: EngineConfig,
    worker_config: WorkerConfig,
) -> Harness {
    let stores = InMemoryStateStore::new();
    let mut registry = FlowRegistry::new();
    configure(&mut registry);
    let registry = Arc::new(registry);

    let engine = FlowEngine::new(
        Arc::clone(&registry),
        stores.flow_store(),
        stores.queue(),
        stores.task_sink.clone(),
        stores.lease_manager(),
        config.clone(),
    );
    let worker = Worker::new(
        engine.runner().clone(),
        stores.flow_store(),
        stores.queue(),
        stores.lease_manager(),
        config,
        worker_config,
    );
    Harness {
        stores,
        engine,
        worker,
    }
}

pub fn client() -> ClientId {
    ClientId("C.1234567890abcdef".to_string())
}

pub fn start(flow_type: &str, args: Value) -> StartRequest {
    StartRequest {
        client_id: Some(client()),
        flow_id: None,
        flow_type: flow_type.to_string(),
        args: Payload::new(args),
        creator: Some("tests".to_string()),
        limits: ResourceLimits::unlimited(),
        parent: None,
        parent_hunt: None,
    }
}

pub fn server_start(flow_type: &str, args: Value) -> StartRequest {
    StartRequest {
        client_id: None,
        ..start(flow_type, args)
    }
}

// -- EchoFlow: one client call, replies land in the state blob ---------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoStates {
    Reply,
}

impl FlowState for EchoStates {
    fn name(&self) -> &'static str {
        match self {
            EchoStates::Reply => "Reply",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Reply" => Some(EchoStates::Reply),
            _ => None,
        }
    }
}

pub struct EchoFlow {
    descriptor: FlowDescriptor,
}

impl EchoFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Echo", "Start"),
        })
    }

    /// Variant that accepts unauthenticated responses
    pub fn tolerant() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("TolerantEcho", "Start").accepting_unauthenticated(),
        })
    }

    /// Variant with a required `message` argument
    pub fn strict() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("StrictEcho", "Start")
                .with_args_schema(json!({ "message": {} })),
        })
    }
}

#[async_trait]
impl FlowLogic for EchoFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, ctx: &mut FlowCtx, args: Payload) -> Result<(), EngineError> {
        let limits = ctx.flow().limits;
        ctx.call_client(EchoStates::Reply, args, limits);
        Ok(())
    }

    async fn resume(
        &self,
        ctx: &mut FlowCtx,
        state: &str,
        batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        match EchoStates::from_name(state)
            .ok_or_else(|| EngineError::UnknownState(state.to_string()))?
        {
            EchoStates::Reply => {
                let values: Vec<Value> =
                    batch.payloads().map(|p| p.as_value().clone()).collect();
                ctx.save_store(&values)?;
                Ok(())
            }
        }
    }
}

// -- NoopFlow: terminates without ever issuing a call ------------------

pub struct NoopFlow {
    descriptor: FlowDescriptor,
}

impl NoopFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Noop", "Start"),
        })
    }
}

#[async_trait]
impl FlowLogic for NoopFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, _ctx: &mut FlowCtx, _args: Payload) -> Result<(), EngineError> {
        Ok(())
    }

    async fn resume(
        &self,
        _ctx: &mut FlowCtx,
        state: &str,
        _batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        Err(EngineError::UnknownState(state.to_string()))
    }
}

// -- FailFlow: the initial handler fails -------------------------------

pub struct FailFlow {
    descriptor: FlowDescriptor,
}

impl FailFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Fail", "Start"),
        })
    }
}

#[async_trait]
impl FlowLogic for FailFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, _ctx: &mut FlowCtx, _args: Payload) -> Result<(), EngineError> {
        Err(EngineError::FlowFailed("begin blew up".to_string()))
    }

    async fn resume(
        &self,
        _ctx: &mut FlowCtx,
        state: &str,
        _batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        Err(EngineError::UnknownState(state.to_string()))
    }
}

// -- Parent and Child: SendReply relay ---------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentStates {
    Collect,
}

impl FlowState for ParentStates {
    fn name(&self) -> &'static str {
        "Collect"
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Collect" => Some(ParentStates::Collect),
            _ => None,
        }
    }
}

pub struct ParentFlow {
    descriptor: FlowDescriptor,
}

impl ParentFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Parent", "Start"),
        })
    }
}

#[async_trait]
impl FlowLogic for ParentFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, ctx: &mut FlowCtx, args: Payload) -> Result<(), EngineError> {
        let limits = ctx.flow().limits;
        let child_type = args
            .as_value()
            .get("child")
            .and_then(Value::as_str)
            .unwrap_or("Child")
            .to_string();
        ctx.call_flow(ParentStates::Collect, child_type, args, limits);
        Ok(())
    }

    async fn resume(
        &self,
        ctx: &mut FlowCtx,
        state: &str,
        batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        match ParentStates::from_name(state)
            .ok_or_else(|| EngineError::UnknownState(state.to_string()))?
        {
            ParentStates::Collect => {
                let collected = json!({
                    "replies": batch.payloads().map(|p| p.as_value().clone()).collect::<Vec<_>>(),
                    "status": batch.status.payload.as_value().clone(),
                });
                ctx.save_store(&collected)?;
                Ok(())
            }
        }
    }
}

pub struct ChildFlow {
    descriptor: FlowDescriptor,
}

impl ChildFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Child", "Start"),
        })
    }
}

#[async_trait]
impl FlowLogic for ChildFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, ctx: &mut FlowCtx, _args: Payload) -> Result<(), EngineError> {
        ctx.send_reply(Payload::new(json!({ "part": 1 })));
        ctx.send_reply(Payload::new(json!({ "part": 2 })));
        Ok(())
    }

    async fn resume(
        &self,
        _ctx: &mut FlowCtx,
        state: &str,
        _batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        Err(EngineError::UnknownState(state.to_string()))
    }
}

// -- TimerFlow: a self-directed call, optionally delayed ---------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStates {
    Wake,
}

impl FlowState for TimerStates {
    fn name(&self) -> &'static str {
        "Wake"
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Wake" => Some(TimerStates::Wake),
            _ => None,
        }
    }
}

pub struct TimerFlow {
    descriptor: FlowDescriptor,
}

impl TimerFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Timer", "Start"),
        })
    }
}

#[async_trait]
impl FlowLogic for TimerFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, ctx: &mut FlowCtx, args: Payload) -> Result<(), EngineError> {
        let delay_secs = args
            .as_value()
            .get("delay_secs")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let start_time = if delay_secs > 0 {
            Some(Utc::now() + Duration::seconds(delay_secs))
        } else {
            None
        };
        ctx.call_state(
            TimerStates::Wake,
            Payload::new(json!({ "ping": true })),
            start_time,
        );
        Ok(())
    }

    async fn resume(
        &self,
        ctx: &mut FlowCtx,
        state: &str,
        batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        match TimerStates::from_name(state)
            .ok_or_else(|| EngineError::UnknownState(state.to_string()))?
        {
            TimerStates::Wake => {
                let woke: Vec<Value> =
                    batch.payloads().map(|p| p.as_value().clone()).collect();
                ctx.save_store(&woke)?;
                Ok(())
            }
        }
    }
}

// -- LingerFlow: suspends on a far-future timer and stays running ------

pub struct LingerFlow {
    descriptor: FlowDescriptor,
}

impl LingerFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Linger", "Start"),
        })
    }
}

#[async_trait]
impl FlowLogic for LingerFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, ctx: &mut FlowCtx, _args: Payload) -> Result<(), EngineError> {
        ctx.call_state(
            TimerStates::Wake,
            Payload::empty(),
            Some(Utc::now() + Duration::hours(24)),
        );
        Ok(())
    }

    async fn resume(
        &self,
        _ctx: &mut FlowCtx,
        state: &str,
        _batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        Err(EngineError::UnknownState(state.to_string()))
    }
}

// -- GateFlow: two client calls; the first handler parks on a gate -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStates {
    First,
    Second,
}

impl FlowState for GateStates {
    fn name(&self) -> &'static str {
        match self {
            GateStates::First => "First",
            GateStates::Second => "Second",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "First" => Some(GateStates::First),
            "Second" => Some(GateStates::Second),
            _ => None,
        }
    }
}

pub struct GateFlow {
    descriptor: FlowDescriptor,
    gate: Arc<Semaphore>,
}

impl GateFlow {
    pub fn new(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Gate", "Start"),
            gate,
        })
    }
}

#[async_trait]
impl FlowLogic for GateFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, ctx: &mut FlowCtx, _args: Payload) -> Result<(), EngineError> {
        let limits = ctx.flow().limits;
        ctx.call_client(GateStates::First, Payload::new(json!({ "step": 1 })), limits);
        ctx.call_client(GateStates::Second, Payload::new(json!({ "step": 2 })), limits);
        Ok(())
    }

    async fn resume(
        &self,
        ctx: &mut FlowCtx,
        state: &str,
        _batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        match GateStates::from_name(state)
            .ok_or_else(|| EngineError::UnknownState(state.to_string()))?
        {
            GateStates::First => {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| EngineError::Other(e.to_string()))?;
                permit.forget();
                Ok(())
            }
            GateStates::Second => {
                ctx.save_store(&json!({ "second": true }))?;
                Ok(())
            }
        }
    }
}

// -- HeartbeatFlow: a handler that outlives the lease window -----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStates {
    Work,
}

impl FlowState for HeartbeatStates {
    fn name(&self) -> &'static str {
        "Work"
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Work" => Some(HeartbeatStates::Work),
            _ => None,
        }
    }
}

pub struct HeartbeatFlow {
    descriptor: FlowDescriptor,
    gate: Option<Arc<Semaphore>>,
}

impl HeartbeatFlow {
    /// Sleeps through three short intervals, heartbeating between them
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Heartbeat", "Start"),
            gate: None,
        })
    }

    /// Variant that parks on a gate, then heartbeats exactly once
    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Heartbeat", "Start"),
            gate: Some(gate),
        })
    }
}

#[async_trait]
impl FlowLogic for HeartbeatFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, ctx: &mut FlowCtx, _args: Payload) -> Result<(), EngineError> {
        let limits = ctx.flow().limits;
        ctx.call_client(HeartbeatStates::Work, Payload::empty(), limits);
        Ok(())
    }

    async fn resume(
        &self,
        ctx: &mut FlowCtx,
        state: &str,
        _batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        match HeartbeatStates::from_name(state)
            .ok_or_else(|| EngineError::UnknownState(state.to_string()))?
        {
            HeartbeatStates::Work => {
                if let Some(gate) = &self.gate {
                    let permit = gate
                        .acquire()
                        .await
                        .map_err(|e| EngineError::Other(e.to_string()))?;
                    permit.forget();
                    ctx.heartbeat().await?;
                } else {
                    for _ in 0..3 {
                        tokio::time::sleep(std::time::Duration::from_millis(450)).await;
                        ctx.heartbeat().await?;
                    }
                }
                ctx.save_store(&json!({ "worked": true }))?;
                Ok(())
            }
        }
    }
}

// -- SplitFlow: one client call plus a far-future timer ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStates {
    Reply,
    Alarm,
}

impl FlowState for SplitStates {
    fn name(&self) -> &'static str {
        match self {
            SplitStates::Reply => "Reply",
            SplitStates::Alarm => "Alarm",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Reply" => Some(SplitStates::Reply),
            "Alarm" => Some(SplitStates::Alarm),
            _ => None,
        }
    }
}

pub struct SplitFlow {
    descriptor: FlowDescriptor,
}

impl SplitFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptor: FlowDescriptor::new("Split", "Start"),
        })
    }
}

#[async_trait]
impl FlowLogic for SplitFlow {
    fn descriptor(&self) -> &FlowDescriptor {
        &self.descriptor
    }

    async fn begin(&self, ctx: &mut FlowCtx, _args: Payload) -> Result<(), EngineError> {
        let limits = ctx.flow().limits;
        ctx.call_client(SplitStates::Reply, Payload::empty(), limits);
        ctx.call_state(
            SplitStates::Alarm,
            Payload::empty(),
            Some(Utc::now() + Duration::hours(1)),
        );
        Ok(())
    }

    async fn resume(
        &self,
        ctx: &mut FlowCtx,
        state: &str,
        _batch: ResponseBatch,
    ) -> Result<(), EngineError> {
        SplitStates::from_name(state)
            .ok_or_else(|| EngineError::UnknownState(state.to_string()))?;
        let mut seen: Vec<String> = ctx.load_store()?.unwrap_or_default();
        seen.push(state.to_string());
        ctx.save_store(&seen)?;
        Ok(())
    }
}

// -- Collector: a well-known flow counting inbound messages ------------

pub struct CollectorFlow {
    session_id: SessionId,
    count: AtomicUsize,
    payloads: Mutex<Vec<Value>>,
}

impl CollectorFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session_id: SessionId::server_local(FlowId("F:collector".to_string())),
            count: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn session(&self) -> SessionId {
        self.session_id.clone()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl WellKnownFlow for CollectorFlow {
    fn session_id(&self) -> SessionId {
        self.session_id.clone()
    }

    async fn process_message(&self, message: Response) -> Result<(), EngineError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .unwrap()
            .push(message.payload.into_value());
        Ok(())
    }
}
