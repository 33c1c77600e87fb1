//! Built-in tasks available in every registry created with
//! [`TaskRegistry::with_builtins`](super::TaskRegistry::with_builtins).

use std::time::Duration;

use serde_json::{Map, Value, json};

use super::registry::{TaskCall, TaskRegistry};
use super::{TaskError, TaskOutput};

pub fn register_builtins(registry: &mut TaskRegistry) {
    registry
        .register("noop", |_call: TaskCall| async { Ok(Map::new()) })
        .register("echo", |call: TaskCall| async move { Ok(call.inputs) })
        .register("log", log)
        .register("sleep", sleep)
        .register("fail", fail);
}

/// Emit a tracing event. Inputs: `message`, optional `level`.
async fn log(call: TaskCall) -> Result<TaskOutput, TaskError> {
    let message = call
        .input("message")
        .map(crate::flow::resolver::render)
        .unwrap_or_default();
    let level = call.input("level").and_then(Value::as_str).unwrap_or("info");
    let run_id = call.ctx.run_id();
    let step_id = call.ctx.step_id();
    match level {
        "error" => tracing::error!(run_id = %run_id, step_id, "{message}"),
        "warn" => tracing::warn!(run_id = %run_id, step_id, "{message}"),
        "debug" => tracing::debug!(run_id = %run_id, step_id, "{message}"),
        "trace" => tracing::trace!(run_id = %run_id, step_id, "{message}"),
        _ => tracing::info!(run_id = %run_id, step_id, "{message}"),
    }
    let mut out = Map::new();
    out.insert("message".into(), Value::String(message));
    Ok(out)
}

/// Sleep for `ms` milliseconds, returning early with an error on cancellation.
async fn sleep(call: TaskCall) -> Result<TaskOutput, TaskError> {
    let ms = call
        .input("ms")
        .and_then(Value::as_u64)
        .ok_or_else(|| TaskError::InvalidInput("`ms` must be a non-negative integer".into()))?;
    tokio::select! {
        _ = call.ctx.cancelled() => Err(TaskError::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(ms)) => {
            let mut out = Map::new();
            out.insert("slept_ms".into(), json!(ms));
            Ok(out)
        }
    }
}

/// Always fails with `message` (default "task failed").
async fn fail(call: TaskCall) -> Result<TaskOutput, TaskError> {
    let message = call
        .input("message")
        .and_then(Value::as_str)
        .unwrap_or("task failed")
        .to_string();
    Err(TaskError::Failed(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::context::ExecutionContext;
    use crate::task::{TaskContext, TaskInvoker};
    use std::sync::Arc;
    use uuid::Uuid;

    fn setup() -> (TaskRegistry, Arc<ExecutionContext>) {
        let ctx = ExecutionContext::root("t", Uuid::now_v7(), Map::new(), Map::new());
        (TaskRegistry::with_builtins(), Arc::new(ctx))
    }

    fn inputs(v: Value) -> TaskOutput {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn echo_returns_inputs() {
        let (registry, ctx) = setup();
        let out = registry
            .invoke("echo", inputs(json!({"a": 1})), &TaskContext::new(ctx, "e"))
            .await
            .unwrap();
        assert_eq!(Value::Object(out), json!({"a": 1}));
    }

    #[tokio::test]
    async fn fail_uses_message() {
        let (registry, ctx) = setup();
        let err = registry
            .invoke("fail", inputs(json!({"message": "nope"})), &TaskContext::new(ctx, "f"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test]
    async fn log_renders_message() {
        let (registry, ctx) = setup();
        let out = registry
            .invoke("log", inputs(json!({"message": 42})), &TaskContext::new(ctx, "l"))
            .await
            .unwrap();
        assert_eq!(out["message"], json!("42"));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_stops_on_cancel() {
        let (registry, ctx) = setup();
        let token = ctx.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = registry
            .invoke("sleep", inputs(json!({"ms": 60_000})), &TaskContext::new(ctx, "s"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
    }

    #[tokio::test]
    async fn sleep_requires_ms() {
        let (registry, ctx) = setup();
        let err = registry
            .invoke("sleep", Map::new(), &TaskContext::new(ctx, "s"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));
    }
}
