//! Shared domain types for stepflow.
//!
//! This crate contains the declarative flow model (definitions, steps,
//! conditions, retry policies), execution events and engine configuration.
//!
//! Zero runtime dependencies -- only serde, serde_json, uuid, chrono.

pub mod config;
pub mod event;
pub mod flow;
