//! Observability setup for stepflow: structured `tracing` output with an
//! optional OpenTelemetry bridge.

pub mod tracing_setup;

pub use tracing_setup::{TracingError, init_tracing, shutdown_tracing};
