//! Application services: the engine front door, the per-flow runner and
//! the worker scheduling loop

pub mod context;
pub mod engine;
pub mod runtime;
pub mod worker;
