//! Recursive step interpreter.
//!
//! `execute_steps` walks a step list in order, dispatching on the step kind.
//! Control-flow kinds recurse into their nested lists through the same
//! function; `parallel` branches and parallel `for_each` iterations are
//! spawned on a `JoinSet` with owned copies of their steps, so nothing
//! spawned borrows from the definition.
//!
//! Every step goes through the same envelope: id expansion, trace and event
//! bookkeeping, optional retry, output recording, and `on_error` handling
//! for recoverable failures.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use stepflow_types::event::FlowEvent;
use stepflow_types::flow::{Condition, FlowDefinition, StepDefinition, StepKind, SwitchCase};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::condition::{ConditionEvaluator, values_equal};
use super::context::Scope;
use super::error::EngineError;
use super::resolver::{
    expand_id_template, render, resolve_map, resolve_str, resolve_value, type_name,
};
use super::retry::RetryExecutor;
use super::subflow::SubflowLoader;
use crate::event::EventBus;
use crate::task::{BoxTaskInvoker, TaskContext, TaskError};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// How a step list finished.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Every step ran; the caller continues with its next sibling.
    Continue,
    /// An `exit` step fired. Propagates to the top of the current flow.
    Exit {
        reason: String,
        outputs: Map<String, Value>,
    },
}

impl StepOutcome {
    pub fn is_exit(&self) -> bool {
        matches!(self, StepOutcome::Exit { .. })
    }
}

/// Output to record for the step (if any) and how execution continues.
type StepResult = Result<(Option<Value>, StepOutcome), EngineError>;

type BranchResult = Result<StepOutcome, EngineError>;

// ---------------------------------------------------------------------------
// StepInterpreter
// ---------------------------------------------------------------------------

/// Executes step trees against a [`Scope`].
///
/// Cheap to clone: all state is behind `Arc`s, which is how branch tasks get
/// their own handle.
#[derive(Debug, Clone)]
pub struct StepInterpreter {
    invoker: BoxTaskInvoker,
    loader: Arc<SubflowLoader>,
    events: EventBus,
}

impl StepInterpreter {
    pub fn new(invoker: BoxTaskInvoker, loader: Arc<SubflowLoader>, events: EventBus) -> Self {
        Self {
            invoker,
            loader,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn loader(&self) -> &Arc<SubflowLoader> {
        &self.loader
    }

    pub fn invoker(&self) -> &BoxTaskInvoker {
        &self.invoker
    }

    /// Execute `steps` in order within `scope`.
    ///
    /// Stops at the first unhandled error or `exit`. Cancellation, and an
    /// `exit` in a sibling parallel branch, are checked before every step.
    pub fn execute_steps<'a>(
        &'a self,
        steps: &'a [StepDefinition],
        scope: &'a Scope,
    ) -> BoxFuture<'a, Result<StepOutcome, EngineError>> {
        Box::pin(async move {
            for (position, step) in steps.iter().enumerate() {
                if scope.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                if scope.is_halted() {
                    tracing::debug!(
                        run_id = %scope.ctx().run_id(),
                        "sibling branch exited, skipping remaining steps"
                    );
                    return Ok(StepOutcome::Continue);
                }
                let outcome = self.execute_step(step, position, scope).await?;
                if outcome.is_exit() {
                    return Ok(outcome);
                }
            }
            Ok(StepOutcome::Continue)
        })
    }

    async fn execute_step(
        &self,
        step: &StepDefinition,
        position: usize,
        scope: &Scope,
    ) -> Result<StepOutcome, EngineError> {
        let ctx = scope.ctx();
        let run_id = ctx.run_id();
        let id = expand_id_template(&step.effective_id(position), scope)?;
        let path = scope.path_for(&id);
        let kind = step.kind.kind_name();

        ctx.record_trace(&path);
        tracing::debug!(run_id = %run_id, step_id = %id, path = %path, kind, "step started");
        self.events.publish(FlowEvent::StepStarted {
            run_id,
            step_id: id.clone(),
            kind: kind.to_string(),
        });
        let started = Instant::now();

        let result = match &step.retry {
            Some(policy) => {
                let token = (!scope.is_shielded()).then(|| ctx.cancellation_token());
                let id = id.as_str();
                RetryExecutor::run(
                    policy,
                    token,
                    move |attempt, delay, err| {
                        let delay_ms = delay.as_millis() as u64;
                        tracing::warn!(
                            run_id = %run_id,
                            step_id = id,
                            attempt,
                            delay_ms,
                            error = %err,
                            "step failed, retrying"
                        );
                        self.events.publish(FlowEvent::StepFailed {
                            run_id,
                            step_id: id.to_string(),
                            error: err.to_string(),
                            will_retry: true,
                        });
                        self.events.publish(FlowEvent::StepRetrying {
                            run_id,
                            step_id: id.to_string(),
                            attempt,
                            delay_ms,
                        });
                    },
                    move |_| self.run_kind(step, id, scope),
                )
                .await
            }
            None => self.run_kind(step, &id, scope).await,
        };

        match result {
            Ok((output, outcome)) => {
                if let Some(output) = output {
                    ctx.set_step_output(&id, visible_outputs(step, output));
                }
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(run_id = %run_id, step_id = %id, duration_ms, "step completed");
                self.events.publish(FlowEvent::StepCompleted {
                    run_id,
                    step_id: id,
                    duration_ms,
                });
                Ok(outcome)
            }
            Err(err) => {
                self.events.publish(FlowEvent::StepFailed {
                    run_id,
                    step_id: id.clone(),
                    error: err.to_string(),
                    will_retry: false,
                });
                match &step.on_error {
                    Some(handlers) if err.is_recoverable() => {
                        tracing::warn!(
                            run_id = %run_id,
                            step_id = %id,
                            error = %err,
                            "step failed, running on_error handlers"
                        );
                        let error = json!({
                            "message": err.to_string(),
                            "step": id,
                            "kind": err.kind(),
                        });
                        ctx.set_step_output(&id, json!({ "error": error.clone() }));
                        let handler_scope =
                            scope.nested(&id).nested("on_error").bind("error", error);
                        self.execute_steps(handlers, &handler_scope).await
                    }
                    _ => {
                        tracing::debug!(run_id = %run_id, step_id = %id, error = %err, "step failed");
                        Err(err)
                    }
                }
            }
        }
    }

    /// One attempt at the kind-specific part of a step.
    async fn run_kind(&self, step: &StepDefinition, id: &str, scope: &Scope) -> StepResult {
        match &step.kind {
            StepKind::Task { task, inputs } => self.run_task(task, inputs, id, scope).await,
            StepKind::Conditional {
                condition,
                then_steps,
                else_steps,
            } => {
                self.run_conditional(condition, then_steps, else_steps.as_deref(), id, scope)
                    .await
            }
            StepKind::Switch {
                subject,
                cases,
                default,
            } => {
                self.run_switch(subject, cases, default.as_deref(), id, scope)
                    .await
            }
            StepKind::Parallel { branches } => self.run_parallel(branches, id, scope).await,
            StepKind::ForEach {
                items,
                var,
                parallel,
                steps,
            } => {
                self.run_for_each(items, var, *parallel, steps, id, scope)
                    .await
            }
            StepKind::Subflow { flow, inputs } => self.run_subflow(flow, inputs, scope).await,
            StepKind::Exit { reason, outputs } => {
                let reason = render(&resolve_str(reason, scope)?);
                let outputs = resolve_map(outputs, scope)?;
                tracing::info!(
                    run_id = %scope.ctx().run_id(),
                    step_id = id,
                    reason = %reason,
                    "exit step reached"
                );
                Ok((
                    Some(json!({ "reason": reason })),
                    StepOutcome::Exit { reason, outputs },
                ))
            }
        }
    }

    // -- task ---------------------------------------------------------------

    async fn run_task(
        &self,
        task: &str,
        inputs: &Map<String, Value>,
        id: &str,
        scope: &Scope,
    ) -> StepResult {
        let inputs = resolve_map(inputs, scope)?;
        if scope.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut task_ctx = TaskContext::new(Arc::clone(scope.ctx()), id);
        if scope.is_shielded() {
            task_ctx = task_ctx.shielded();
        }
        match self.invoker.invoke(task, inputs, &task_ctx).await {
            Ok(output) => Ok((Some(Value::Object(output)), StepOutcome::Continue)),
            Err(TaskError::Cancelled) if scope.is_cancelled() => Err(EngineError::Cancelled),
            Err(source) => Err(EngineError::TaskInvocation {
                task: task.to_string(),
                source,
            }),
        }
    }

    // -- branching ----------------------------------------------------------

    async fn run_conditional(
        &self,
        condition: &Condition,
        then_steps: &[StepDefinition],
        else_steps: Option<&[StepDefinition]>,
        id: &str,
        scope: &Scope,
    ) -> StepResult {
        let (branch, steps) = match (ConditionEvaluator::evaluate(condition, scope)?, else_steps) {
            (true, _) => ("then", Some(then_steps)),
            (false, Some(steps)) => ("else", Some(steps)),
            (false, None) => ("none", None),
        };
        tracing::debug!(step_id = id, branch, "condition evaluated");

        let outcome = match steps {
            Some(steps) => self.execute_steps(steps, &scope.nested(id)).await?,
            None => StepOutcome::Continue,
        };
        Ok((Some(json!({ "branch": branch })), outcome))
    }

    async fn run_switch(
        &self,
        subject: &Value,
        cases: &[SwitchCase],
        default: Option<&[StepDefinition]>,
        id: &str,
        scope: &Scope,
    ) -> StepResult {
        let subject = resolve_value(subject, scope)?;

        let mut selected = None;
        for (index, case) in cases.iter().enumerate() {
            let hit = match resolve_value(&case.matches, scope)? {
                Value::Array(options) => options.iter().any(|o| values_equal(o, &subject)),
                single => values_equal(&single, &subject),
            };
            if hit {
                selected = Some((json!(index), case.steps.as_slice()));
                break;
            }
        }
        if selected.is_none() {
            selected = default.map(|steps| (json!("default"), steps));
        }

        match selected {
            Some((case, steps)) => {
                tracing::debug!(step_id = id, case = %case, "switch case selected");
                let outcome = self.execute_steps(steps, &scope.nested(id)).await?;
                Ok((Some(json!({ "case": case })), outcome))
            }
            None => {
                tracing::debug!(step_id = id, subject = %subject, "no switch case matched");
                Ok((Some(json!({ "case": null })), StepOutcome::Continue))
            }
        }
    }

    // -- concurrency --------------------------------------------------------

    async fn run_parallel(
        &self,
        branches: &[Vec<StepDefinition>],
        id: &str,
        scope: &Scope,
    ) -> StepResult {
        let halt = scope.branch_halt();
        let base = scope.nested(id).halted_by(halt.clone());
        let mut set: JoinSet<(usize, BranchResult)> = JoinSet::new();
        for (index, branch) in branches.iter().enumerate() {
            let interpreter = self.clone();
            let steps = branch.clone();
            let branch_scope = base.nested(&format!("branch_{index}"));
            let halt = halt.clone();
            set.spawn(async move {
                let result = interpreter.execute_steps(&steps, &branch_scope).await;
                halt_on_exit(&halt, &result);
                (index, result)
            });
        }

        let results = join_ordered(set, branches.len()).await;
        let outcome = merge_outcomes(results)?;
        Ok((Some(json!({ "branches": branches.len() })), outcome))
    }

    async fn run_for_each(
        &self,
        items: &Value,
        var: &str,
        parallel: bool,
        steps: &[StepDefinition],
        id: &str,
        scope: &Scope,
    ) -> StepResult {
        let resolved = resolve_value(items, scope)?;
        let found = type_name(&resolved);
        let Value::Array(items_list) = resolved else {
            return Err(EngineError::TypeMismatch {
                reference: render(items),
                reason: format!("for_each items must be an array, got {found}"),
            });
        };
        let count = items_list.len();
        let base = scope.nested(id);
        tracing::debug!(step_id = id, count, parallel, "iterating");

        if parallel {
            let halt = scope.branch_halt();
            let base = base.halted_by(halt.clone());
            let body: Arc<[StepDefinition]> = steps.into();
            let mut set: JoinSet<(usize, BranchResult)> = JoinSet::new();
            for (index, item) in items_list.into_iter().enumerate() {
                let interpreter = self.clone();
                let body = Arc::clone(&body);
                let iteration = base.nested(&index.to_string()).bind(var, item);
                let halt = halt.clone();
                set.spawn(async move {
                    let result = interpreter.execute_steps(&body, &iteration).await;
                    halt_on_exit(&halt, &result);
                    (index, result)
                });
            }
            let outcome = merge_outcomes(join_ordered(set, count).await)?;
            return Ok((Some(json!({ "iterations": count })), outcome));
        }

        for (index, item) in items_list.into_iter().enumerate() {
            if scope.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if scope.is_halted() {
                return Ok((Some(json!({ "iterations": index })), StepOutcome::Continue));
            }
            let iteration = base.nested(&index.to_string()).bind(var, item);
            let outcome = self.execute_steps(steps, &iteration).await?;
            if outcome.is_exit() {
                return Ok((Some(json!({ "iterations": index + 1 })), outcome));
            }
        }
        Ok((Some(json!({ "iterations": count })), StepOutcome::Continue))
    }

    // -- subflow ------------------------------------------------------------

    async fn run_subflow(
        &self,
        flow: &str,
        inputs: &Map<String, Value>,
        scope: &Scope,
    ) -> StepResult {
        let inputs = resolve_map(inputs, scope)?;
        let stack = self.loader.enter(scope.ctx().call_stack(), flow)?;
        let _active = ActiveCall {
            loader: &self.loader,
            name: flow,
        };

        let def = self.loader.load(flow).await?;
        let inputs = prepare_inputs(&def, inputs)?;
        let parent = scope.ctx();
        let child_run = Uuid::now_v7();
        let child = Arc::new(parent.child(def.name.clone(), child_run, inputs, stack));
        let mut child_scope = Scope::new(Arc::clone(&child));
        if scope.is_shielded() {
            child_scope = child_scope.shielded();
        }
        if let Some(halt) = scope.halt() {
            child_scope = child_scope.halted_by(halt.clone());
        }

        tracing::debug!(
            parent_run = %parent.run_id(),
            child_run = %child_run,
            subflow = %def.name,
            depth = child.call_stack().depth() - 1,
            "entering subflow"
        );
        self.events.publish(FlowEvent::RunStarted {
            run_id: child_run,
            flow: def.name.clone(),
        });
        let started = Instant::now();

        match self.execute_steps(&def.steps, &child_scope).await {
            Ok(outcome) => {
                let (terminated, overrides) = match outcome {
                    StepOutcome::Exit { outputs, .. } => (true, Some(outputs)),
                    StepOutcome::Continue => (false, None),
                };
                let outputs = collect_outputs(&def, &child_scope, overrides.as_ref());
                self.events.publish(FlowEvent::RunCompleted {
                    run_id: child_run,
                    flow: def.name.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    terminated,
                });
                Ok((Some(Value::Object(outputs)), StepOutcome::Continue))
            }
            Err(EngineError::Cancelled) => {
                if !def.on_cancel.is_empty() {
                    let cancel_scope = Scope::new(child).nested("on_cancel").shielded();
                    if let Err(e) = self.execute_steps(&def.on_cancel, &cancel_scope).await {
                        tracing::warn!(subflow = %def.name, error = %e, "on_cancel steps failed");
                    }
                }
                self.events.publish(FlowEvent::RunCancelled {
                    run_id: child_run,
                    flow: def.name.clone(),
                    at: chrono::Utc::now(),
                });
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                self.events.publish(FlowEvent::RunFailed {
                    run_id: child_run,
                    flow: def.name.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

/// Pairs a successful [`SubflowLoader::enter`] with its `exit`, even when
/// the call future is dropped.
struct ActiveCall<'a> {
    loader: &'a SubflowLoader,
    name: &'a str,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.loader.exit(self.name);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Wait for every spawned branch and return the results in spawn order.
async fn join_ordered(mut set: JoinSet<(usize, BranchResult)>, count: usize) -> Vec<BranchResult> {
    let mut slots: Vec<Option<BranchResult>> = vec![None; count];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(e) => tracing::error!(error = %e, "branch task panicked"),
        }
    }
    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| Err(EngineError::Internal("branch task panicked".into())))
        })
        .collect()
}

/// Stop the remaining sibling branches once one of them exits.
fn halt_on_exit(halt: &CancellationToken, result: &BranchResult) {
    if matches!(result, Ok(StepOutcome::Exit { .. })) {
        halt.cancel();
    }
}

/// The first failing branch decides the error; otherwise the first branch
/// that hit `exit` decides the exit.
fn merge_outcomes(results: Vec<BranchResult>) -> Result<StepOutcome, EngineError> {
    let mut exit = None;
    for result in results {
        let outcome = result?;
        if exit.is_none() && outcome.is_exit() {
            exit = Some(outcome);
        }
    }
    Ok(exit.unwrap_or(StepOutcome::Continue))
}

/// Apply the step's `outputs` filter to an object output.
fn visible_outputs(step: &StepDefinition, output: Value) -> Value {
    match (&step.outputs, output) {
        (Some(keys), Value::Object(mut map)) => {
            map.retain(|k, _| keys.iter().any(|key| key == k));
            Value::Object(map)
        }
        (_, output) => output,
    }
}

/// Validate caller-supplied inputs against the flow's input schema and fill
/// in defaults. Undeclared inputs are passed through untouched.
pub fn prepare_inputs(
    def: &FlowDefinition,
    mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    for spec in &def.inputs {
        match provided.get(&spec.name) {
            Some(value) if !spec.input_type.accepts(value) => {
                return Err(EngineError::InvalidInput(format!(
                    "input '{}' of flow '{}' must be {}, got {}",
                    spec.name,
                    def.name,
                    spec.input_type.as_str(),
                    type_name(value),
                )));
            }
            Some(_) => {}
            None => match &spec.default {
                Some(default) => {
                    provided.insert(spec.name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(EngineError::InvalidInput(format!(
                        "missing required input '{}' for flow '{}'",
                        spec.name, def.name
                    )));
                }
                None => {}
            },
        }
    }
    Ok(provided)
}

/// Resolve the flow's declared outputs. Values from an `exit` step take
/// precedence; bindings that cannot be resolved are omitted with a warning.
pub fn collect_outputs(
    def: &FlowDefinition,
    scope: &Scope,
    overrides: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut outputs = Map::new();
    for binding in &def.outputs {
        if let Some(value) = overrides.and_then(|o| o.get(&binding.name)) {
            outputs.insert(binding.name.clone(), value.clone());
            continue;
        }
        match resolve_str(&binding.value, scope) {
            Ok(value) => {
                outputs.insert(binding.name.clone(), value);
            }
            Err(e) => tracing::warn!(
                flow = %def.name,
                output = %binding.name,
                error = %e,
                "output binding could not be resolved, omitting"
            ),
        }
    }
    outputs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
