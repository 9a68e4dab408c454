//! The flow type registry
//!
//! An explicit registry object constructed once at process start and
//! passed by reference to the engine and the worker loop; there is no
//! ambient global registry.

use crate::{
    domain::flow::SessionId,
    types::Payload,
    EngineError, FlowLogic, WellKnownFlow,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Static properties of a registered flow type
#[derive(Debug, Clone)]
pub struct FlowDescriptor {
    /// Registered type name
    pub name: String,

    /// Name of the designated start handler
    pub start_state: String,

    /// Whether unauthenticated (agent-originated) responses are accepted.
    /// Ordinary flows drop them before batching.
    pub accepts_unauthenticated: bool,

    /// Argument schema: an object whose keys are required argument names.
    /// `None` accepts any args.
    pub args_schema: Option<serde_json::Value>,
}

impl FlowDescriptor {
    /// Build a descriptor for an ordinary flow type
    pub fn new(name: impl Into<String>, start_state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_state: start_state.into(),
            accepts_unauthenticated: false,
            args_schema: None,
        }
    }

    /// Accept unauthenticated responses (agent-originated traffic)
    pub fn accepting_unauthenticated(mut self) -> Self {
        self.accepts_unauthenticated = true;
        self
    }

    /// Declare required argument keys
    pub fn with_args_schema(mut self, schema: serde_json::Value) -> Self {
        self.args_schema = Some(schema);
        self
    }

    /// Validate start args against the schema
    ///
    /// Every key of the schema object must be present in the args object.
    pub fn validate_args(&self, args: &Payload) -> Result<(), EngineError> {
        let Some(schema) = &self.args_schema else {
            return Ok(());
        };
        let Some(required) = schema.as_object() else {
            return Ok(());
        };
        let supplied = args.as_object().ok_or_else(|| {
            EngineError::ValidationError(format!(
                "flow {} requires object args, got {}",
                self.name,
                args.as_value()
            ))
        })?;
        for key in required.keys() {
            if !supplied.contains_key(key) {
                return Err(EngineError::ValidationError(format!(
                    "flow {} missing required argument '{}'",
                    self.name, key
                )));
            }
        }
        Ok(())
    }
}

/// Registry of flow types and well-known flows
///
/// Built once at startup; lookups are read-only afterwards.
#[derive(Default)]
pub struct FlowRegistry {
    flows: HashMap<String, Arc<dyn FlowLogic>>,
    well_known: HashMap<SessionId, Arc<dyn WellKnownFlow>>,
}

impl FlowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow type under its descriptor name
    pub fn register(&mut self, logic: Arc<dyn FlowLogic>) -> &mut Self {
        let name = logic.descriptor().name.clone();
        self.flows.insert(name, logic);
        self
    }

    /// Register a well-known flow under its fixed session id
    pub fn register_well_known(&mut self, flow: Arc<dyn WellKnownFlow>) -> &mut Self {
        self.well_known.insert(flow.session_id(), flow);
        self
    }

    /// Look up a flow type by name
    pub fn get(&self, flow_type: &str) -> Result<Arc<dyn FlowLogic>, EngineError> {
        self.flows
            .get(flow_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownFlow(format!("flow type {flow_type}")))
    }

    /// Look up a well-known flow by its fixed session id
    pub fn get_well_known(&self, session_id: &SessionId) -> Option<Arc<dyn WellKnownFlow>> {
        self.well_known.get(session_id).cloned()
    }

    /// Names of all registered flow types
    pub fn flow_types(&self) -> Vec<&str> {
        self.flows.keys().map(String::as_str).collect()
    }
}
