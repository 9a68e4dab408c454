//!
//! Fleetflow Core - The flow execution engine for the Fleetflow platform
//!
//! A flow is a persisted, resumable unit of work. It runs until it issues
//! asynchronous calls, is suspended and persisted, and is resumed by a
//! worker once its replies have arrived, exactly where it left off. This
//! crate defines the flow entity and runtime, the request/response
//! protocol, the queue and notification contracts, lease-based mutual
//! exclusion, and the worker scheduling loop.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;

/// Domain layer - entities, protocol messages, repository traits
pub mod domain;

/// Application services - engine, runtime, worker loop
pub mod application;

/// Core value types
pub mod types;

/// Error types
pub mod error;

/// Engine and worker configuration
pub mod config;

// Re-export key types
pub use config::{EngineConfig, WorkerConfig};
pub use error::EngineError;
pub use types::{Payload, Priority, ResourceLimits, ResourceUsage};

// Domain API
pub use domain::flow::{
    ClientId, Flow, FlowId, FlowStatus, HuntId, ParentRef, RequestId, ResponseId, SessionId,
    WorkerId,
};
pub use domain::lease::{acquire_blocking, Lease, LeaseGuard, LeaseManager};
pub use domain::message::{
    AuthState, CallTarget, Notification, Request, Response, ResponseBatch, ResponseKind,
};
pub use domain::registry::{FlowDescriptor, FlowRegistry};
pub use domain::repository::{FlowStore, MessageQueue, TaskSink};

// Application API
pub use application::context::FlowCtx;
pub use application::engine::FlowEngine;
pub use application::runtime::{FlowRunner, ProcessOutcome, StartRequest};
pub use application::worker::{RunStats, Worker, WorkerEvent};

/// The closed set of state identifiers of one flow type
///
/// Each flow type declares its states as a fieldless enum and maps names
/// explicitly in `from_name`; strings exist only at the persistence
/// boundary, never as a dispatch mechanism.
pub trait FlowState: Sized + Copy + Send + 'static {
    /// Serialized name of this state
    fn name(&self) -> &'static str;

    /// Parse a persisted state name; `None` for names this flow type
    /// does not define
    fn from_name(name: &str) -> Option<Self>;
}

/// The logic of one flow type
///
/// `begin` runs synchronously on the starter's task; `resume` is invoked
/// by a worker with one ordered response batch per completed request.
/// Implementations parse `state` into their own [`FlowState`] enum and
/// match on it; an unrecognized name is an error, not a silent no-op.
#[async_trait]
pub trait FlowLogic: Send + Sync {
    /// Static properties of this flow type
    fn descriptor(&self) -> &FlowDescriptor;

    /// Run the initial handler
    async fn begin(&self, ctx: &mut FlowCtx, args: Payload) -> Result<(), EngineError>;

    /// Run the handler registered for `state` with one completed
    /// request's ordered batch
    async fn resume(
        &self,
        ctx: &mut FlowCtx,
        state: &str,
        batch: ResponseBatch,
    ) -> Result<(), EngineError>;
}

/// A flow with a fixed, predeclared session id that processes every
/// inbound message immediately and independently
///
/// Well-known flows bypass the request/response protocol: no pairing, no
/// ordering across messages, no lease, no scheduling. They exist so that
/// fire-and-forget fan-in traffic does not pay full flow overhead.
#[async_trait]
pub trait WellKnownFlow: Send + Sync {
    /// The fixed session id this flow answers on
    fn session_id(&self) -> SessionId;

    /// Process one inbound message
    async fn process_message(&self, message: Response) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PingStates {
        Start,
        Done,
    }

    impl FlowState for PingStates {
        fn name(&self) -> &'static str {
            match self {
                PingStates::Start => "Start",
                PingStates::Done => "Done",
            }
        }

        fn from_name(name: &str) -> Option<Self> {
            match name {
                "Start" => Some(PingStates::Start),
                "Done" => Some(PingStates::Done),
                _ => None,
            }
        }
    }

    #[test]
    fn test_flow_state_name_round_trip() {
        for state in [PingStates::Start, PingStates::Done] {
            assert_eq!(PingStates::from_name(state.name()), Some(state));
        }
    }

    #[test]
    fn test_flow_state_rejects_unknown_names() {
        assert_eq!(PingStates::from_name("NotAState"), None);
        assert_eq!(PingStates::from_name(""), None);
        // Names are exact, not case-folded
        assert_eq!(PingStates::from_name("start"), None);
    }
}
