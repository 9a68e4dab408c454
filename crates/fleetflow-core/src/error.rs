use thiserror::Error;

/// Core error type for the Fleetflow engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Flow not found in the store
    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    /// A flow with the requested id already exists
    #[error("Can not start flow with existing id: {0}")]
    FlowAlreadyExists(String),

    /// Business-logic failure raised by a flow handler
    #[error("Flow error: {0}")]
    FlowFailed(String),

    /// The lease on a flow is held by another owner
    #[error("Lock busy: {0}")]
    LockBusy(String),

    /// The lease expired while it was held
    #[error("Lock expired: {0}")]
    LockExpired(String),

    /// A resource budget was breached
    #[error("Resource limit exceeded ({budget}): {detail}")]
    ResourceExceeded {
        /// Name of the breached budget (cpu, network, runtime)
        budget: &'static str,
        /// Usage detail for the reason string
        detail: String,
    },

    /// The flow exceeded its processing deadline without a heartbeat
    #[error("stuck in worker")]
    StuckFlow,

    /// Argument or descriptor validation failure
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A handler declared a state its flow type does not define
    #[error("Unknown flow state: {0}")]
    UnknownState(String),

    /// Storage backend failure
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Transport backend failure
    #[error("Task send error: {0}")]
    TaskSendError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Build a resource-breach error whose reason names the budget
    pub fn resource_exceeded(budget: &'static str, usage_detail: impl Into<String>) -> Self {
        EngineError::ResourceExceeded {
            budget,
            detail: usage_detail.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IOError(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}
