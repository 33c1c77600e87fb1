//! Cooperative cancellation of a running flow.
//!
//! Cancelling a run sets its cancelled flag, trips the cancellation token
//! (which child subflow contexts inherit), runs every registered cleanup
//! handler in LIFO order and finally executes the flow's `on_cancel` steps.
//! Only the first request does any of this; later requests are no-ops.

use std::sync::Arc;

use chrono::Utc;
use stepflow_types::event::FlowEvent;
use stepflow_types::flow::StepDefinition;

use super::context::{CleanupStack, ExecutionContext, Scope};
use super::interpreter::StepInterpreter;

/// Stateless cancellation driver.
pub struct CancellationManager;

impl CancellationManager {
    /// Cancel the run owning `ctx`.
    ///
    /// Returns `false` if the run had already been cancelled, in which case
    /// nothing is executed. Callers that need to wait for the first request
    /// to finish should await [`ExecutionContext::wait_cancel_complete`].
    pub async fn cancel(
        ctx: &Arc<ExecutionContext>,
        on_cancel: &[StepDefinition],
        interpreter: &StepInterpreter,
    ) -> bool {
        if !ctx.mark_cancelled() {
            tracing::debug!(run_id = %ctx.run_id(), "cancellation already requested");
            return false;
        }

        tracing::info!(
            run_id = %ctx.run_id(),
            flow = ctx.flow_name(),
            current_step = ctx.current_step().as_deref().unwrap_or("-"),
            "cancelling flow"
        );
        ctx.cancellation_token().cancel();

        let handlers = Self::run_cleanup(ctx.cleanup_stack()).await;
        tracing::debug!(run_id = %ctx.run_id(), handlers, "cleanup handlers finished");

        if !on_cancel.is_empty() {
            let scope = Scope::new(Arc::clone(ctx)).nested("on_cancel").shielded();
            if let Err(e) = interpreter.execute_steps(on_cancel, &scope).await {
                tracing::warn!(
                    run_id = %ctx.run_id(),
                    error = %e,
                    "on_cancel steps failed"
                );
            }
        }

        interpreter.events().publish(FlowEvent::RunCancelled {
            run_id: ctx.run_id(),
            flow: ctx.flow_name().to_string(),
            at: Utc::now(),
        });
        ctx.mark_cancel_complete();
        true
    }

    /// Drain `stack` and run its handlers most-recent first.
    ///
    /// Handler failures are logged and do not stop the remaining handlers.
    /// Returns the number of handlers run.
    pub async fn run_cleanup(stack: &CleanupStack) -> usize {
        let handlers = stack.drain();
        let count = handlers.len();
        for (name, handler) in handlers {
            tracing::debug!(handler = %name, "running cleanup handler");
            if let Err(e) = handler().await {
                tracing::warn!(handler = %name, error = %e, "cleanup handler failed");
            }
        }
        count
    }
}
