//! Per-run execution state and the scope views the interpreter reads from.
//!
//! One `ExecutionContext` exists per flow invocation and is shared via `Arc`
//! with every concurrent branch. Step outputs live in a `DashMap`; branch step
//! ids are disjoint, so concurrent inserts never contend on the same key.
//! A `Scope` layers loop/error bindings and the current step path on top.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::resolver::VariableLookup;

/// Default cap on a single step output (1 MB).
pub const DEFAULT_MAX_STEP_OUTPUT_BYTES: usize = 1_048_576;

// ---------------------------------------------------------------------------
// Call stack
// ---------------------------------------------------------------------------

/// Ordered names of the flows currently being executed, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack(Vec<String>);

impl CallStack {
    pub fn new(root: impl Into<String>) -> Self {
        Self(vec![root.into()])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// A new stack with `name` appended; `self` is left untouched.
    pub fn pushed(&self, name: impl Into<String>) -> Self {
        let mut names = self.0.clone();
        names.push(name.into());
        Self(names)
    }

    /// Render the cycle closed by re-entering `name`, e.g. `A → B → C → A`.
    pub fn cycle_with(&self, name: &str) -> String {
        let start = self.0.iter().position(|n| n == name).unwrap_or(0);
        let mut cycle: Vec<&str> = self.0[start..].iter().map(String::as_str).collect();
        cycle.push(name);
        cycle.join(" → ")
    }
}

// ---------------------------------------------------------------------------
// Cleanup stack
// ---------------------------------------------------------------------------

pub type CleanupHandler = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Box an async closure as a [`CleanupHandler`].
pub fn cleanup_handler<F, Fut>(f: F) -> CleanupHandler
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f()) })
}

#[derive(Default)]
struct CleanupState {
    handlers: Vec<(String, CleanupHandler)>,
    drained: bool,
}

/// LIFO list of cleanup handlers, consumed exactly once.
#[derive(Default)]
pub struct CleanupStack {
    state: Mutex<CleanupState>,
}

impl CleanupStack {
    fn lock(&self) -> MutexGuard<'_, CleanupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a handler. Once the stack has been drained the handler is
    /// handed back so the caller can run it immediately.
    pub fn push(
        &self,
        name: impl Into<String>,
        handler: CleanupHandler,
    ) -> Result<(), CleanupHandler> {
        let mut state = self.lock();
        if state.drained {
            return Err(handler);
        }
        state.handlers.push((name.into(), handler));
        Ok(())
    }

    /// Take every handler in reverse registration order. Only the first call
    /// returns anything.
    pub fn drain(&self) -> Vec<(String, CleanupHandler)> {
        let mut state = self.lock();
        state.drained = true;
        let mut handlers = std::mem::take(&mut state.handlers);
        handlers.reverse();
        handlers
    }

    pub fn len(&self) -> usize {
        self.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CleanupStack")
            .field("pending", &state.handlers.len())
            .field("drained", &state.drained)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state of a single flow invocation.
#[derive(Debug)]
pub struct ExecutionContext {
    flow_name: String,
    run_id: Uuid,
    inputs: Value,
    env: Value,
    outputs: DashMap<String, Value>,
    call_stack: CallStack,
    cancel_token: CancellationToken,
    cancelled: AtomicBool,
    cancel_done: CancellationToken,
    cleanup: Arc<CleanupStack>,
    trace: Mutex<Vec<String>>,
    max_output_bytes: usize,
}

impl ExecutionContext {
    /// Context for a top-level invocation.
    pub fn root(
        flow_name: impl Into<String>,
        run_id: Uuid,
        inputs: Map<String, Value>,
        env: Map<String, Value>,
    ) -> Self {
        let flow_name = flow_name.into();
        Self {
            call_stack: CallStack::new(flow_name.clone()),
            flow_name,
            run_id,
            inputs: Value::Object(inputs),
            env: Value::Object(env),
            outputs: DashMap::new(),
            cancel_token: CancellationToken::new(),
            cancelled: AtomicBool::new(false),
            cancel_done: CancellationToken::new(),
            cleanup: Arc::new(CleanupStack::default()),
            trace: Mutex::new(Vec::new()),
            max_output_bytes: DEFAULT_MAX_STEP_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Context for a subflow call. Nothing is inherited implicitly except the
    /// environment, the cleanup stack and cancellation.
    pub fn child(
        &self,
        flow_name: impl Into<String>,
        run_id: Uuid,
        inputs: Map<String, Value>,
        call_stack: CallStack,
    ) -> Self {
        Self {
            flow_name: flow_name.into(),
            run_id,
            inputs: Value::Object(inputs),
            env: self.env.clone(),
            outputs: DashMap::new(),
            call_stack,
            cancel_token: self.cancel_token.child_token(),
            cancelled: AtomicBool::new(false),
            cancel_done: CancellationToken::new(),
            cleanup: Arc::clone(&self.cleanup),
            trace: Mutex::new(Vec::new()),
            max_output_bytes: self.max_output_bytes,
        }
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    // -- outputs ------------------------------------------------------------

    /// Store a step output, replacing oversized values with a marker.
    pub fn set_step_output(&self, step_id: &str, output: Value) {
        let size = serde_json::to_vec(&output).map(|v| v.len()).unwrap_or(0);
        let stored = if size > self.max_output_bytes {
            tracing::warn!(
                run_id = %self.run_id,
                step_id,
                size,
                max = self.max_output_bytes,
                "step output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!(
                    "output exceeded {} byte limit and was truncated",
                    self.max_output_bytes
                ),
            })
        } else {
            output
        };
        self.outputs.insert(step_id.to_string(), stored);
    }

    pub fn step_output(&self, step_id: &str) -> Option<Value> {
        self.outputs.get(step_id).map(|v| v.value().clone())
    }

    pub fn has_output(&self, step_id: &str) -> bool {
        self.outputs.contains_key(step_id)
    }

    pub fn outputs_snapshot(&self) -> Map<String, Value> {
        self.outputs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    // -- cancellation -------------------------------------------------------

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Set the cancelled flag. Returns `true` only for the first caller.
    pub fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Signal that cleanup handlers and `on_cancel` steps have finished.
    pub fn mark_cancel_complete(&self) {
        self.cancel_done.cancel();
    }

    /// Wait until [`mark_cancel_complete`](Self::mark_cancel_complete) is called.
    pub async fn wait_cancel_complete(&self) {
        self.cancel_done.cancelled().await
    }

    // -- cleanup ------------------------------------------------------------

    /// Register a cleanup handler. If cleanup has already run the handler is
    /// spawned immediately instead of being lost.
    pub fn register_cleanup<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handler = cleanup_handler(f);
        tracing::debug!(run_id = %self.run_id, handler = %name, "registering cleanup handler");
        if let Err(handler) = self.cleanup.push(name.clone(), handler) {
            tracing::debug!(handler = %name, "cleanup already ran, invoking handler now");
            tokio::spawn(async move {
                if let Err(e) = handler().await {
                    tracing::warn!(handler = %name, error = %e, "late cleanup handler failed");
                }
            });
        }
    }

    pub fn cleanup_stack(&self) -> &Arc<CleanupStack> {
        &self.cleanup
    }

    // -- trace --------------------------------------------------------------

    pub fn record_trace(&self, path: &str) {
        self.trace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.to_string());
    }

    /// Step paths in the order they were entered.
    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Path of the most recently entered step.
    pub fn current_step(&self) -> Option<String> {
        self.trace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A read view over a context plus the bindings active at one point in the
/// step tree. Cheap to clone; each loop iteration and branch gets its own.
#[derive(Debug, Clone)]
pub struct Scope {
    ctx: Arc<ExecutionContext>,
    bindings: HashMap<String, Value>,
    path: String,
    shielded: bool,
    /// Tripped when a sibling branch of an enclosing parallel node exits.
    halt: Option<CancellationToken>,
}

impl Scope {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self {
            ctx,
            bindings: HashMap::new(),
            path: String::new(),
            shielded: false,
            halt: None,
        }
    }

    pub fn ctx(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// A copy of this scope with `name` bound to `value`.
    pub fn bind(&self, name: impl Into<String>, value: Value) -> Self {
        let mut scope = self.clone();
        scope.bindings.insert(name.into(), value);
        scope
    }

    /// A copy of this scope whose path is extended by `segment`.
    pub fn nested(&self, segment: &str) -> Self {
        let mut scope = self.clone();
        scope.path = self.path_for(segment);
        scope
    }

    /// Full path of a step executed directly in this scope.
    pub fn path_for(&self, step_id: &str) -> String {
        if self.path.is_empty() {
            step_id.to_string()
        } else {
            format!("{}/{}", self.path, step_id)
        }
    }

    /// A copy that ignores cancellation, used for `on_cancel` steps.
    pub fn shielded(&self) -> Self {
        let mut scope = self.clone();
        scope.shielded = true;
        scope
    }

    pub fn is_shielded(&self) -> bool {
        self.shielded
    }

    pub fn is_cancelled(&self) -> bool {
        !self.shielded && self.ctx.is_cancelled()
    }

    /// A fresh exit signal for the branches of a parallel node opened in
    /// this scope. It is a child of any enclosing signal, so an exit further
    /// out also stops nested branches.
    pub fn branch_halt(&self) -> CancellationToken {
        self.halt
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_else(CancellationToken::new)
    }

    /// A copy of this scope that stops once `halt` is tripped.
    pub fn halted_by(&self, halt: CancellationToken) -> Self {
        let mut scope = self.clone();
        scope.halt = Some(halt);
        scope
    }

    /// The exit signal this scope observes, if it runs inside a parallel node.
    pub fn halt(&self) -> Option<&CancellationToken> {
        self.halt.as_ref()
    }

    /// Whether a sibling branch has exited and remaining steps should be
    /// skipped.
    pub fn is_halted(&self) -> bool {
        self.halt.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

impl VariableLookup for Scope {
    fn lookup(&self, root: &str) -> Option<Value> {
        if let Some(v) = self.bindings.get(root) {
            return Some(v.clone());
        }
        match root {
            "inputs" => Some(self.ctx.inputs.clone()),
            "env" => Some(self.ctx.env.clone()),
            id => self.ctx.step_output(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
