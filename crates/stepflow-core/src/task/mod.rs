//! Task invocation layer.
//!
//! The interpreter never runs task code itself; it hands the task name, the
//! resolved inputs and a [`TaskContext`] to a [`TaskInvoker`]. The default
//! invoker is the explicit [`registry::TaskRegistry`].
//!
//! `TaskInvoker` uses RPITIT, so dynamic dispatch goes through the
//! blanket-implemented [`TaskInvokerDyn`] and the [`BoxTaskInvoker`] wrapper.

pub mod builtin;
pub mod connection;
pub mod registry;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::flow::context::ExecutionContext;
use connection::ConnectionError;

pub use registry::TaskRegistry;

/// Output map returned by a task.
pub type TaskOutput = Map<String, Value>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("task cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// What a task may see of the running flow: identity, cancellation, and
/// cleanup registration.
#[derive(Debug, Clone)]
pub struct TaskContext {
    ctx: Arc<ExecutionContext>,
    step_id: String,
    shielded: bool,
}

impl TaskContext {
    pub fn new(ctx: Arc<ExecutionContext>, step_id: impl Into<String>) -> Self {
        Self {
            ctx,
            step_id: step_id.into(),
            shielded: false,
        }
    }

    /// A context that never reports cancellation, for `on_cancel` steps.
    pub fn shielded(mut self) -> Self {
        self.shielded = true;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id()
    }

    pub fn flow_name(&self) -> &str {
        self.ctx.flow_name()
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn is_cancelled(&self) -> bool {
        !self.shielded && self.ctx.is_cancelled()
    }

    /// Resolves once the run is cancelled. Never resolves when shielded.
    pub async fn cancelled(&self) {
        if self.shielded {
            std::future::pending::<()>().await
        }
        self.ctx.cancellation_token().cancelled().await
    }

    /// Register a handler that releases a resource on completion or cancel.
    pub fn register_cleanup<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ctx.register_cleanup(name, f);
    }
}

// ---------------------------------------------------------------------------
// TaskInvoker
// ---------------------------------------------------------------------------

/// Executes named tasks on behalf of the interpreter.
pub trait TaskInvoker: Send + Sync {
    /// Whether `name` can be invoked. Used to reject flows before they start.
    fn has_task(&self, name: &str) -> bool;

    fn invoke(
        &self,
        task: &str,
        inputs: TaskOutput,
        ctx: &TaskContext,
    ) -> impl Future<Output = Result<TaskOutput, TaskError>> + Send;
}

/// Object-safe version of [`TaskInvoker`] with boxed futures.
pub trait TaskInvokerDyn: Send + Sync {
    fn has_task(&self, name: &str) -> bool;

    fn invoke_boxed<'a>(
        &'a self,
        task: &'a str,
        inputs: TaskOutput,
        ctx: &'a TaskContext,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutput, TaskError>> + Send + 'a>>;
}

impl<T: TaskInvoker> TaskInvokerDyn for T {
    fn has_task(&self, name: &str) -> bool {
        TaskInvoker::has_task(self, name)
    }

    fn invoke_boxed<'a>(
        &'a self,
        task: &'a str,
        inputs: TaskOutput,
        ctx: &'a TaskContext,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutput, TaskError>> + Send + 'a>> {
        Box::pin(self.invoke(task, inputs, ctx))
    }
}

/// Type-erased task invoker, cheap to clone into spawned branches.
#[derive(Clone)]
pub struct BoxTaskInvoker {
    inner: Arc<dyn TaskInvokerDyn>,
}

impl BoxTaskInvoker {
    pub fn new<T: TaskInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Arc::new(invoker),
        }
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.inner.has_task(name)
    }

    pub async fn invoke(
        &self,
        task: &str,
        inputs: TaskOutput,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        self.inner.invoke_boxed(task, inputs, ctx).await
    }
}

impl std::fmt::Debug for BoxTaskInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTaskInvoker").finish_non_exhaustive()
    }
}
