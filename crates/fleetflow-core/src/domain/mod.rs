//! Domain layer: entities, protocol messages, leases, repository traits

/// Flow identifiers and the flow entity
pub mod flow;

/// Lease manager contract and scoped guard
pub mod lease;

/// Requests, responses, batches and notifications
pub mod message;

/// Flow type registry and descriptors
pub mod registry;

/// Persistence and transport contracts
pub mod repository;
