//! Errors raised while a flow executes.

use thiserror::Error;
use uuid::Uuid;

use super::definition::FlowError;
use super::resolver::ResolveError;
use crate::task::TaskError;

/// Errors propagated by the step interpreter.
///
/// Recoverable variants are eligible for `retry` and `on_error`; everything
/// else aborts the run regardless of handlers.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Malformed definition or reference to an unknown task.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("unresolved reference `{reference}`: {reason}")]
    UnresolvedReference { reference: String, reason: String },

    #[error("type mismatch in `{reference}`: {reason}")]
    TypeMismatch { reference: String, reason: String },

    #[error("task '{task}' failed: {source}")]
    TaskInvocation {
        task: String,
        #[source]
        source: TaskError,
    },

    /// The subflow call chain re-enters a flow already on the stack.
    #[error("circular subflow dependency: {cycle}")]
    CircularDependency { cycle: String },

    #[error("subflow '{0}' not found")]
    SubflowNotFound(String),

    #[error("subflow depth {depth} exceeds maximum {max}")]
    SubflowDepthExceeded { depth: usize, max: usize },

    /// Caller-supplied inputs violate the flow's input schema.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("flow cancelled")]
    Cancelled,

    /// No in-flight run with this id (for `cancel`).
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether `retry` and `on_error` may handle this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::UnresolvedReference { .. }
                | EngineError::TypeMismatch { .. }
                | EngineError::TaskInvocation { .. }
        )
    }

    /// Short machine-readable kind, exposed to `on_error` as `${error.kind}`.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::InvalidExpression(_) => "invalid_expression",
            EngineError::UnresolvedReference { .. } => "unresolved_reference",
            EngineError::TypeMismatch { .. } => "type_mismatch",
            EngineError::TaskInvocation { .. } => "task_invocation",
            EngineError::CircularDependency { .. } => "circular_dependency",
            EngineError::SubflowNotFound(_) => "subflow_not_found",
            EngineError::SubflowDepthExceeded { .. } => "subflow_depth_exceeded",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Cancelled => "cancelled",
            EngineError::RunNotFound(_) => "run_not_found",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<ResolveError> for EngineError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::InvalidExpression(e) => EngineError::InvalidExpression(e.to_string()),
            ResolveError::UnresolvedReference { reference, reason } => {
                EngineError::UnresolvedReference { reference, reason }
            }
            ResolveError::TypeMismatch { reference, reason } => {
                EngineError::TypeMismatch { reference, reason }
            }
        }
    }
}

impl From<FlowError> for EngineError {
    fn from(err: FlowError) -> Self {
        EngineError::Validation(err.to_string())
    }
}
