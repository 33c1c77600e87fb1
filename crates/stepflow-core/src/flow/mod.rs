//! Flow engine core: definition parsing, variable resolution and interpretation.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `expression` -- `${...}` template grammar
//! - `resolver` -- evaluates expressions against a scope
//! - `condition` -- comparison and `any`/`all`/`none` evaluation
//! - `context` -- per-run state, step outputs, cleanup stack
//! - `retry` -- bounded retry with exponential backoff
//! - `subflow` -- flow sources, definition cache, call-stack bookkeeping
//! - `cancel` -- cancellation and cleanup manager
//! - `interpreter` -- recursive step walker
//! - `engine` -- `FlowEngine` facade and run registry

pub mod cancel;
pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod expression;
pub mod interpreter;
pub mod resolver;
pub mod retry;
pub mod subflow;

pub use engine::{FlowEngine, FlowResult, RunHandle};
pub use error::EngineError;
