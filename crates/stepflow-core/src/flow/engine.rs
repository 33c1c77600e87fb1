//! `FlowEngine`: the entry point trigger drivers and embedders call.
//!
//! The engine validates a definition against the task invoker, checks the
//! caller's inputs, creates a fresh [`ExecutionContext`] and hands the step
//! tree to the [`StepInterpreter`]. In-flight runs are tracked by `run_id`
//! so that [`FlowEngine::cancel`] can reach them from another task.
//!
//! # Execution flow
//!
//! 1. Validate the definition and reject unknown tasks.
//! 2. Apply input defaults and type checks.
//! 3. Register the run and publish `RunStarted`.
//! 4. Interpret the top-level steps.
//! 5. Run cleanup handlers (or wait for cancellation to finish them).
//! 6. Resolve the declared outputs and build a [`FlowResult`].

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::{Map, Value};
use stepflow_types::config::EngineConfig;
use stepflow_types::event::FlowEvent;
use stepflow_types::flow::FlowDefinition;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::cancel::CancellationManager;
use super::context::{ExecutionContext, Scope};
use super::definition::{referenced_tasks, validate_definition};
use super::error::EngineError;
use super::interpreter::{StepInterpreter, StepOutcome, collect_outputs, prepare_inputs};
use super::subflow::{BoxFlowSource, InMemoryFlowSource, SubflowLoader};
use crate::event::EventBus;
use crate::task::{BoxTaskInvoker, TaskRegistry};

// ---------------------------------------------------------------------------
// FlowResult
// ---------------------------------------------------------------------------

/// Structured result of one flow invocation.
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub run_id: Uuid,
    pub flow: String,
    /// `true` for normal completion and for `exit`; `false` on failure or
    /// cancellation.
    pub success: bool,
    /// Declared flow outputs only.
    pub outputs: Map<String, Value>,
    /// Set when an `exit` step ended the run.
    pub terminated: bool,
    pub termination_reason: Option<String>,
    pub cancelled: bool,
    pub error: Option<EngineError>,
    /// Every recorded step output, for diagnostics.
    pub step_outputs: Map<String, Value>,
    /// Step paths in the order they were entered.
    pub trace: Vec<String>,
    pub duration_ms: u64,
}

impl FlowResult {
    fn rejected(run_id: Uuid, flow: &str, error: EngineError) -> Self {
        Self {
            run_id,
            flow: flow.to_string(),
            success: false,
            outputs: Map::new(),
            terminated: false,
            termination_reason: None,
            cancelled: false,
            error: Some(error),
            step_outputs: Map::new(),
            trace: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Handle to a run started with [`FlowEngine::spawn_flow`].
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    join: JoinHandle<FlowResult>,
}

impl RunHandle {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<FlowResult, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Internal(format!("run task failed: {e}")))
    }
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

struct ActiveRun {
    ctx: Arc<ExecutionContext>,
    definition: Arc<FlowDefinition>,
}

struct EngineInner {
    interpreter: StepInterpreter,
    config: EngineConfig,
    /// In-flight runs keyed by run_id.
    runs: DashMap<Uuid, ActiveRun>,
}

/// Interprets flow definitions. Cloning shares the run registry.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl FlowEngine {
    pub fn new(invoker: BoxTaskInvoker, source: BoxFlowSource, config: EngineConfig) -> Self {
        let loader = SubflowLoader::new(source, config.max_subflow_depth);
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(EngineInner {
                interpreter: StepInterpreter::new(invoker, Arc::new(loader), events),
                config,
                runs: DashMap::new(),
            }),
        }
    }

    /// An engine with default config whose subflows come only from
    /// [`register_flow`](Self::register_flow).
    pub fn with_registry(registry: TaskRegistry) -> Self {
        Self::new(
            BoxTaskInvoker::new(registry),
            BoxFlowSource::new(InMemoryFlowSource::new()),
            EngineConfig::default(),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        self.inner.interpreter.events()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events().subscribe()
    }

    /// Validate `def` and make it callable as a subflow by name.
    pub fn register_flow(&self, def: FlowDefinition) -> Result<(), EngineError> {
        self.validate_flow(&def)?;
        tracing::debug!(flow = %def.name, "registered flow");
        self.inner.interpreter.loader().register(def);
        Ok(())
    }

    /// Structural validation plus a check that every task exists.
    pub fn validate_flow(&self, def: &FlowDefinition) -> Result<(), EngineError> {
        validate_definition(def)?;
        let invoker = self.inner.interpreter.invoker();
        if let Some(missing) = referenced_tasks(def)
            .into_iter()
            .find(|task| !invoker.has_task(task))
        {
            return Err(EngineError::Validation(format!(
                "flow '{}' references unknown task '{missing}'",
                def.name
            )));
        }
        Ok(())
    }

    /// Run `def` to completion on the current task.
    pub async fn execute_flow(&self, def: &FlowDefinition, inputs: Map<String, Value>) -> FlowResult {
        let def = Arc::new(def.clone());
        let run_id = Uuid::now_v7();
        match self.start_run(Arc::clone(&def), inputs, run_id) {
            Ok(ctx) => self.drive(def, ctx).await,
            Err(e) => self.reject(run_id, &def.name, e),
        }
    }

    /// Resolve a flow by name through the subflow loader and run it.
    pub async fn execute_named(&self, name: &str, inputs: Map<String, Value>) -> FlowResult {
        match self.inner.interpreter.loader().load(name).await {
            Ok(def) => self.execute_flow(&def, inputs).await,
            Err(e) => self.reject(Uuid::now_v7(), name, e),
        }
    }

    /// Start `def` on a new tokio task. The run is registered before this
    /// returns, so it can be cancelled immediately.
    pub fn spawn_flow(&self, def: Arc<FlowDefinition>, inputs: Map<String, Value>) -> RunHandle {
        let run_id = Uuid::now_v7();
        let started = self.start_run(Arc::clone(&def), inputs, run_id);
        let engine = self.clone();
        let join = tokio::spawn(async move {
            match started {
                Ok(ctx) => engine.drive(def, ctx).await,
                Err(e) => engine.reject(run_id, &def.name, e),
            }
        });
        RunHandle { run_id, join }
    }

    /// Cancel an in-flight run and wait for its cleanup and `on_cancel`
    /// steps to finish. Repeated requests are harmless.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let (ctx, definition) = {
            let run = self
                .inner
                .runs
                .get(&run_id)
                .ok_or(EngineError::RunNotFound(run_id))?;
            (Arc::clone(&run.ctx), Arc::clone(&run.definition))
        };
        CancellationManager::cancel(&ctx, &definition.on_cancel, &self.inner.interpreter).await;
        ctx.wait_cancel_complete().await;
        Ok(())
    }

    /// Ids of runs currently executing.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.inner.runs.iter().map(|r| *r.key()).collect()
    }

    // -- internals ----------------------------------------------------------

    fn start_run(
        &self,
        def: Arc<FlowDefinition>,
        inputs: Map<String, Value>,
        run_id: Uuid,
    ) -> Result<Arc<ExecutionContext>, EngineError> {
        self.validate_flow(&def)?;
        let inputs = prepare_inputs(&def, inputs)?;
        let env = environment_from(&self.inner.config, std::env::vars());
        let ctx = Arc::new(
            ExecutionContext::root(def.name.clone(), run_id, inputs, env)
                .with_max_output_bytes(self.inner.config.max_step_output_bytes),
        );
        self.inner.runs.insert(
            run_id,
            ActiveRun {
                ctx: Arc::clone(&ctx),
                definition: def,
            },
        );
        Ok(ctx)
    }

    fn reject(&self, run_id: Uuid, flow: &str, error: EngineError) -> FlowResult {
        tracing::warn!(run_id = %run_id, flow, error = %error, "flow rejected");
        self.events().publish(FlowEvent::RunFailed {
            run_id,
            flow: flow.to_string(),
            error: error.to_string(),
        });
        FlowResult::rejected(run_id, flow, error)
    }

    async fn drive(&self, def: Arc<FlowDefinition>, ctx: Arc<ExecutionContext>) -> FlowResult {
        let interpreter = &self.inner.interpreter;
        let run_id = ctx.run_id();
        let started = Instant::now();

        tracing::info!(run_id = %run_id, flow = %def.name, "flow started");
        self.events().publish(FlowEvent::RunStarted {
            run_id,
            flow: def.name.clone(),
        });

        let scope = Scope::new(Arc::clone(&ctx));
        let outcome = interpreter.execute_steps(&def.steps, &scope).await;
        self.inner.runs.remove(&run_id);

        if ctx.is_cancelled() {
            CancellationManager::cancel(&ctx, &def.on_cancel, interpreter).await;
            ctx.wait_cancel_complete().await;
        } else {
            let handlers = CancellationManager::run_cleanup(ctx.cleanup_stack()).await;
            if handlers > 0 {
                tracing::debug!(run_id = %run_id, handlers, "ran cleanup handlers");
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let mut result = FlowResult {
            run_id,
            flow: def.name.clone(),
            success: false,
            outputs: Map::new(),
            terminated: false,
            termination_reason: None,
            cancelled: ctx.is_cancelled(),
            error: None,
            step_outputs: Map::new(),
            trace: ctx.trace(),
            duration_ms,
        };

        match outcome {
            Ok(_) if result.cancelled => {
                result.error = Some(EngineError::Cancelled);
                tracing::info!(
                    run_id = %run_id,
                    flow = %def.name,
                    "flow cancelled after its last step"
                );
            }
            Ok(outcome) => {
                let overrides = match outcome {
                    StepOutcome::Exit { reason, outputs } => {
                        result.terminated = true;
                        result.termination_reason = Some(reason);
                        Some(outputs)
                    }
                    StepOutcome::Continue => None,
                };
                result.outputs = collect_outputs(&def, &scope, overrides.as_ref());
                result.success = true;
                tracing::info!(
                    run_id = %run_id,
                    flow = %def.name,
                    duration_ms,
                    terminated = result.terminated,
                    "flow completed"
                );
                self.events().publish(FlowEvent::RunCompleted {
                    run_id,
                    flow: def.name.clone(),
                    duration_ms,
                    terminated: result.terminated,
                });
            }
            Err(EngineError::Cancelled) => {
                result.cancelled = true;
                result.error = Some(EngineError::Cancelled);
                tracing::info!(run_id = %run_id, flow = %def.name, "flow cancelled");
            }
            Err(err) => {
                tracing::error!(run_id = %run_id, flow = %def.name, error = %err, "flow failed");
                self.events().publish(FlowEvent::RunFailed {
                    run_id,
                    flow: def.name.clone(),
                    error: err.to_string(),
                });
                result.error = Some(err);
            }
        }

        result.step_outputs = ctx.outputs_snapshot();
        result
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("active_runs", &self.inner.runs.len())
            .field("loader", self.inner.interpreter.loader())
            .finish()
    }
}

/// The `env` scope for a run, honouring `expose_env` and `env_allowlist`.
fn environment_from(
    config: &EngineConfig,
    vars: impl Iterator<Item = (String, String)>,
) -> Map<String, Value> {
    if !config.expose_env {
        return Map::new();
    }
    vars.filter(|(name, _)| config.env_allowlist.is_empty() || config.env_allowlist.contains(name))
        .map(|(name, value)| (name, Value::String(value)))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::parse_flow_yaml;
    use crate::task::registry::TaskCall;
    use crate::task::TaskError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Mutex, OnceLock};
    use tokio::sync::Notify;

    type Log = Arc<Mutex<Vec<String>>>;

    fn flow(yaml: &str) -> FlowDefinition {
        parse_flow_yaml(yaml).unwrap()
    }

    fn inputs(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    /// Builtins plus `task_a`/`task_b`/`task_c`, which log their name and
    /// echo their inputs.
    fn recording_registry(log: &Log) -> TaskRegistry {
        let mut registry = TaskRegistry::with_builtins();
        for name in ["task_a", "task_b", "task_c"] {
            let log = Arc::clone(log);
            registry.register(name, move |call: TaskCall| {
                log.lock().unwrap().push(name.to_string());
                async move { Ok(call.inputs) }
            });
        }
        registry
    }

    #[tokio::test]
    async fn outputs_only_contain_declared_bindings() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        let def = flow(
            r#"
name: declared
steps:
  - id: data
    type: task
    task: echo
    inputs: { a: 1, b: 2, c: 3 }
outputs:
  - { name: a, value: "${data.a}" }
  - { name: ghost, value: "${data.missing}" }
"#,
        );
        let result = engine.execute_flow(&def, Map::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(Value::Object(result.outputs.clone()), json!({"a": 1}));
        assert!(result.outputs.keys().all(|k| def.declares_output(k)));
    }

    #[tokio::test]
    async fn conditional_is_a_guard_not_a_stop() {
        let log: Log = Arc::default();
        let engine = FlowEngine::with_registry(recording_registry(&log));
        let def = flow(
            r#"
name: guard
inputs:
  - { name: x, type: integer, required: true }
steps:
  - type: conditional
    condition: "${inputs.x} > 3"
    then:
      - { type: task, task: task_a, inputs: { from: a } }
    else:
      - { type: task, task: task_b, inputs: { from: b } }
  - { type: task, task: task_c, inputs: { from: c } }
outputs:
  - { name: first, value: "${task_a.from}" }
  - { name: last, value: "${task_c.from}" }
"#,
        );

        let result = engine.execute_flow(&def, inputs(json!({"x": 5}))).await;
        assert!(result.success);
        assert_eq!(*log.lock().unwrap(), ["task_a", "task_c"]);
        assert_eq!(Value::Object(result.outputs), json!({"first": "a", "last": "c"}));
        assert_eq!(result.step_outputs["conditional_0"], json!({"branch": "then"}));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_failure_waits_for_siblings() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        let def = flow(
            r#"
name: fan-out
steps:
  - type: parallel
    branches:
      - - { type: task, task: sleep, inputs: { ms: 50 } }
        - { id: task_a, type: task, task: echo, inputs: { done: true } }
      - - { id: task_b, type: task, task: fail, inputs: { message: "b broke" } }
  - { id: never, type: task, task: noop }
"#,
        );
        let result = engine.execute_flow(&def, Map::new()).await;

        assert!(!result.success);
        assert!(matches!(
            &result.error,
            Some(EngineError::TaskInvocation { task, .. }) if task == "fail"
        ));
        assert_eq!(result.step_outputs["task_a"], json!({"done": true}));
        assert!(!result.step_outputs.contains_key("never"));
    }

    #[tokio::test]
    async fn for_each_expands_step_ids_per_item() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        let def = flow(
            r#"
name: loop
steps:
  - type: for_each
    items: [{ id: 1 }, { id: 2 }]
    steps:
      - id: "process_${item.id}"
        type: task
        task: echo
        inputs: { seen: "${item.id}" }
"#,
        );
        let result = engine.execute_flow(&def, Map::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.step_outputs["process_1"], json!({"seen": 1}));
        assert_eq!(result.step_outputs["process_2"], json!({"seen": 2}));
        assert_eq!(
            result.trace,
            ["for_each_0", "for_each_0/0/process_1", "for_each_0/1/process_2"]
        );
    }

    #[tokio::test]
    async fn subflow_cycle_is_reported() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        for (name, next) in [("A", "B"), ("B", "C"), ("C", "A")] {
            let def = flow(&format!(
                "name: {name}\nsteps:\n  - type: subflow\n    flow: {next}\n"
            ));
            engine.register_flow(def).unwrap();
        }

        let result = engine.execute_named("A", Map::new()).await;
        assert!(!result.success);
        match result.error {
            Some(EngineError::CircularDependency { cycle }) => assert_eq!(cycle, "A → B → C → A"),
            other => panic!("expected circular dependency, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subflow_returns_declared_outputs_only() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        engine
            .register_flow(flow(
                r#"
name: child
inputs:
  - { name: n, type: integer, required: true }
steps:
  - id: inner
    type: task
    task: echo
    inputs: { value: "${inputs.n}", secret: hidden }
outputs:
  - { name: result, value: "${inner.value}" }
"#,
            ))
            .unwrap();

        let parent = flow(
            r#"
name: parent
steps:
  - { id: call, type: subflow, flow: child, inputs: { n: 21 } }
  - { id: after, type: task, task: echo, inputs: { got: "${call.result}" } }
outputs:
  - { name: got, value: "${after.got}" }
"#,
        );
        let result = engine.execute_flow(&parent, Map::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.outputs["got"], json!(21));
        assert_eq!(result.step_outputs["call"], json!({"result": 21}));
        assert!(!result.step_outputs.contains_key("inner"));
    }

    #[tokio::test]
    async fn subflow_input_errors_are_fatal() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        engine
            .register_flow(flow(
                "name: child\ninputs:\n  - { name: n, type: integer, required: true }\nsteps:\n  - { type: task, task: noop }\n",
            ))
            .unwrap();
        let parent = flow(
            r#"
name: parent
steps:
  - type: subflow
    flow: child
    on_error: [{ id: handled, type: task, task: noop }]
"#,
        );
        let result = engine.execute_flow(&parent, Map::new()).await;
        assert!(matches!(result.error, Some(EngineError::InvalidInput(_))));
        assert!(!result.step_outputs.contains_key("handled"));
    }

    #[tokio::test]
    async fn exit_terminates_the_whole_flow() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        let def = flow(
            r#"
name: early
steps:
  - { id: first, type: task, task: echo, inputs: { status: normal } }
  - type: for_each
    items: [1, 2, 3]
    steps:
      - type: conditional
        condition: "${item} == 2"
        then:
          - type: exit
            reason: "stopped at ${item}"
            outputs: { status: early }
  - { id: last, type: task, task: noop }
outputs:
  - { name: status, value: "${first.status}" }
"#,
        );
        let result = engine.execute_flow(&def, Map::new()).await;
        assert!(result.success);
        assert!(result.terminated);
        assert_eq!(result.termination_reason.as_deref(), Some("stopped at 2"));
        assert_eq!(result.outputs["status"], json!("early"));
        assert!(!result.step_outputs.contains_key("last"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retry_falls_through_to_on_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = TaskRegistry::with_builtins();
        let c = Arc::clone(&calls);
        registry.register("flaky", move |_call: TaskCall| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::Failed("upstream unavailable".into())) }
        });
        let engine = FlowEngine::with_registry(registry);
        let def = flow(
            r#"
name: resilient
steps:
  - id: fetch
    type: task
    task: flaky
    retry: { max_attempts: 2, initial_delay_ms: 100 }
    on_error:
      - id: fallback
        type: task
        task: echo
        inputs: { kind: "${error.kind}" }
outputs:
  - { name: kind, value: "${fallback.kind}" }
"#,
        );
        let result = engine.execute_flow(&def, Map::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.outputs["kind"], json!("task_invocation"));
    }

    #[tokio::test]
    async fn cancel_runs_cleanup_once_and_on_cancel_steps() {
        let log: Log = Arc::default();
        let ready = Arc::new(Notify::new());
        let mut registry = TaskRegistry::with_builtins();
        let (l, r) = (Arc::clone(&log), Arc::clone(&ready));
        registry.register("acquire", move |call: TaskCall| {
            let (log, ready) = (Arc::clone(&l), Arc::clone(&r));
            async move {
                for name in ["h1", "h2", "h3"] {
                    let log = Arc::clone(&log);
                    call.ctx.register_cleanup(name, move || async move {
                        log.lock().unwrap().push(name.to_string());
                        Ok(())
                    });
                }
                ready.notify_one();
                call.ctx.cancelled().await;
                Err(TaskError::Cancelled)
            }
        });
        let engine = FlowEngine::with_registry(registry);
        let def = Arc::new(flow(
            r#"
name: holder
steps:
  - { type: task, task: acquire }
  - { id: unreachable, type: task, task: noop }
on_cancel:
  - { id: cancel_note, type: task, task: echo, inputs: { note: bye } }
"#,
        ));

        let handle = engine.spawn_flow(def, Map::new());
        let run_id = handle.run_id;
        ready.notified().await;

        let (a, b) = tokio::join!(engine.cancel(run_id), engine.cancel(run_id));
        assert!(a.is_ok());
        assert!(matches!(b, Ok(()) | Err(EngineError::RunNotFound(_))));

        let result = handle.wait().await.unwrap();
        assert!(!result.success);
        assert!(result.cancelled);
        assert!(matches!(result.error, Some(EngineError::Cancelled)));
        assert_eq!(*log.lock().unwrap(), ["h3", "h2", "h1"]);
        assert_eq!(result.step_outputs["cancel_note"], json!({"note": "bye"}));
        assert!(!result.step_outputs.contains_key("unreachable"));

        assert!(matches!(
            engine.cancel(run_id).await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exit_in_one_branch_stops_its_siblings() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        let def = flow(
            r#"
name: race
steps:
  - type: parallel
    branches:
      - - { type: exit, reason: done early }
      - - { type: task, task: sleep, inputs: { ms: 50 } }
        - { id: late, type: task, task: echo, inputs: { ran: true } }
  - { id: after, type: task, task: noop }
"#,
        );
        let result = engine.execute_flow(&def, Map::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.terminated);
        assert_eq!(result.termination_reason.as_deref(), Some("done early"));
        assert!(!result.step_outputs.contains_key("late"));
        assert!(!result.step_outputs.contains_key("after"));
    }

    #[tokio::test(start_paused = true)]
    async fn exit_in_parallel_for_each_stops_other_iterations() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        let def = flow(
            r#"
name: race-loop
steps:
  - type: for_each
    items: [1, 2, 3]
    parallel: true
    steps:
      - type: conditional
        condition: "${item} == 1"
        then:
          - { type: exit, reason: "first wins" }
        else:
          - { type: task, task: sleep, inputs: { ms: 50 } }
          - { id: "late_${item}", type: task, task: noop }
"#,
        );
        let result = engine.execute_flow(&def, Map::new()).await;
        assert!(result.terminated);
        assert_eq!(result.termination_reason.as_deref(), Some("first wins"));
        assert!(!result.step_outputs.contains_key("late_2"));
        assert!(!result.step_outputs.contains_key("late_3"));
    }

    #[tokio::test]
    async fn cancel_stops_for_each_between_iterations() {
        let log: Log = Arc::default();
        let ready = Arc::new(Notify::new());
        let mut registry = TaskRegistry::with_builtins();
        let (l, r) = (Arc::clone(&log), Arc::clone(&ready));
        registry.register("visit", move |call: TaskCall| {
            let (log, ready) = (Arc::clone(&l), Arc::clone(&r));
            async move {
                let n = call.inputs.get("n").cloned().unwrap_or_default();
                log.lock().unwrap().push(n.to_string());
                if n == json!(2) {
                    ready.notify_one();
                    // Finishes its own work even after cancellation.
                    call.ctx.cancelled().await;
                }
                Ok(call.inputs)
            }
        });
        let engine = FlowEngine::with_registry(registry);
        let def = Arc::new(flow(
            r#"
name: walker
steps:
  - type: for_each
    items: [1, 2, 3, 4]
    steps:
      - { id: "visit_${item}", type: task, task: visit, inputs: { n: "${item}" } }
"#,
        ));

        let handle = engine.spawn_flow(def, Map::new());
        ready.notified().await;
        engine.cancel(handle.run_id).await.unwrap();
        let result = handle.wait().await.unwrap();

        assert!(result.cancelled);
        assert!(matches!(result.error, Some(EngineError::Cancelled)));
        assert_eq!(*log.lock().unwrap(), ["1", "2"]);
        assert!(result.step_outputs.contains_key("visit_2"));
        assert!(!result.step_outputs.contains_key("visit_3"));
        assert!(!result.step_outputs.contains_key("visit_4"));
    }

    #[tokio::test]
    async fn cancel_inside_subflow_runs_child_on_cancel() {
        let log: Log = Arc::default();
        let ready = Arc::new(Notify::new());
        let mut registry = TaskRegistry::with_builtins();
        let r = Arc::clone(&ready);
        registry.register("hold", move |call: TaskCall| {
            let ready = Arc::clone(&r);
            async move {
                ready.notify_one();
                call.ctx.cancelled().await;
                Err(TaskError::Cancelled)
            }
        });
        let l = Arc::clone(&log);
        registry.register("note", move |call: TaskCall| {
            let who = call.inputs.get("who").and_then(Value::as_str).unwrap_or("?");
            l.lock().unwrap().push(who.to_string());
            async { Ok(Map::new()) }
        });
        let engine = FlowEngine::with_registry(registry);
        engine
            .register_flow(flow(
                r#"
name: worker
steps:
  - { type: task, task: hold }
on_cancel:
  - { type: task, task: note, inputs: { who: child } }
"#,
            ))
            .unwrap();
        let mut rx = engine.subscribe();
        let def = Arc::new(flow(
            r#"
name: boss
steps:
  - { id: job, type: subflow, flow: worker }
  - { id: after, type: task, task: noop }
on_cancel:
  - { type: task, task: note, inputs: { who: parent } }
"#,
        ));

        let handle = engine.spawn_flow(def, Map::new());
        ready.notified().await;
        engine.cancel(handle.run_id).await.unwrap();
        let result = handle.wait().await.unwrap();

        assert!(!result.success);
        assert!(matches!(result.error, Some(EngineError::Cancelled)));
        assert!(!result.step_outputs.contains_key("job"));
        assert!(!result.step_outputs.contains_key("after"));

        let mut notes = log.lock().unwrap().clone();
        notes.sort();
        assert_eq!(notes, ["child", "parent"]);

        let mut cancelled_flows = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FlowEvent::RunCancelled { flow, .. } = event {
                cancelled_flows.push(flow);
            }
        }
        cancelled_flows.sort();
        assert_eq!(cancelled_flows, ["boss", "worker"]);
    }

    #[tokio::test]
    async fn cancel_after_last_step_is_not_a_success() {
        let slot: Arc<OnceLock<FlowEngine>> = Arc::default();
        let mut registry = TaskRegistry::with_builtins();
        let s = Arc::clone(&slot);
        registry.register("stop_self", move |call: TaskCall| {
            let slot = Arc::clone(&s);
            async move {
                if let Some(engine) = slot.get() {
                    engine.cancel(call.ctx.run_id()).await.unwrap();
                }
                Ok(Map::new())
            }
        });
        let engine = FlowEngine::with_registry(registry);
        slot.set(engine.clone()).unwrap();

        let def = flow(
            "name: selfstop
steps:
  - { type: task, task: stop_self }
outputs:
  - { name: x, value: \"1\" }
",
        );
        let result = engine.execute_flow(&def, Map::new()).await;
        assert!(result.cancelled);
        assert!(!result.success);
        assert!(matches!(result.error, Some(EngineError::Cancelled)));
        assert!(result.outputs.is_empty());
    }

    #[tokio::test]
    async fn cleanup_runs_on_normal_completion() {
        let log: Log = Arc::default();
        let mut registry = TaskRegistry::with_builtins();
        let l = Arc::clone(&log);
        registry.register("open", move |call: TaskCall| {
            let log = Arc::clone(&l);
            call.ctx.register_cleanup("close", move || async move {
                log.lock().unwrap().push("close".into());
                Ok(())
            });
            async { Ok(Map::new()) }
        });
        let engine = FlowEngine::with_registry(registry);
        let def = flow("name: tidy\nsteps:\n  - { type: task, task: open }\n");
        let result = engine.execute_flow(&def, Map::new()).await;
        assert!(result.success);
        assert_eq!(*log.lock().unwrap(), ["close"]);
        assert!(engine.active_runs().is_empty());
    }

    #[tokio::test]
    async fn invalid_inputs_and_unknown_tasks_are_rejected() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        let typed = flow(
            "name: typed\ninputs:\n  - { name: id, type: string, required: true }\nsteps:\n  - { type: task, task: noop }\n",
        );
        let result = engine.execute_flow(&typed, inputs(json!({"id": 7}))).await;
        assert!(matches!(result.error, Some(EngineError::InvalidInput(_))));
        assert!(result.trace.is_empty());

        let unknown = flow("name: unknown\nsteps:\n  - { type: task, task: teleport }\n");
        let result = engine.execute_flow(&unknown, Map::new()).await;
        match result.error {
            Some(EngineError::Validation(msg)) => assert!(msg.contains("teleport")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lifecycle_events_are_broadcast() {
        let engine = FlowEngine::with_registry(TaskRegistry::with_builtins());
        let mut rx = engine.subscribe();
        let def = flow("name: evented\nsteps:\n  - { id: only, type: task, task: noop }\n");
        let result = engine.execute_flow(&def, Map::new()).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.run_id(), result.run_id);
            kinds.push(serde_json::to_value(&event).unwrap()["type"].clone());
        }
        assert_eq!(
            kinds,
            [
                json!("run_started"),
                json!("step_started"),
                json!("step_completed"),
                json!("run_completed"),
            ]
        );
    }

    #[test]
    fn environment_respects_config() {
        let vars = || {
            vec![
                ("HOME".to_string(), "/root".to_string()),
                ("TOKEN".to_string(), "secret".to_string()),
            ]
            .into_iter()
        };

        let mut config = EngineConfig::default();
        assert_eq!(environment_from(&config, vars()).len(), 2);

        config.env_allowlist = vec!["HOME".into()];
        let env = environment_from(&config, vars());
        assert_eq!(Value::Object(env), json!({"HOME": "/root"}));

        config.expose_env = false;
        assert!(environment_from(&config, vars()).is_empty());
    }
}
