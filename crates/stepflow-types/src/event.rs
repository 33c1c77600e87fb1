//! Lifecycle events broadcast while flows run.
//!
//! `FlowEvent` is Clone + Send + Sync so it can travel over a tokio
//! broadcast channel to any number of subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted by the engine during a flow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A run has started (including subflow runs).
    RunStarted { run_id: Uuid, flow: String },

    /// A run finished successfully. `terminated` is set when an exit step
    /// ended it early.
    RunCompleted {
        run_id: Uuid,
        flow: String,
        duration_ms: u64,
        terminated: bool,
    },

    /// A run failed with an unhandled step error.
    RunFailed {
        run_id: Uuid,
        flow: String,
        error: String,
    },

    /// A run was cancelled.
    RunCancelled {
        run_id: Uuid,
        flow: String,
        at: DateTime<Utc>,
    },

    /// A step began executing.
    StepStarted {
        run_id: Uuid,
        step_id: String,
        kind: String,
    },

    /// A step completed and its output was recorded.
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// A step is about to be retried after sleeping `delay_ms`.
    StepRetrying {
        run_id: Uuid,
        step_id: String,
        /// The attempt about to run (1-indexed).
        attempt: u32,
        delay_ms: u64,
    },
}

impl FlowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            FlowEvent::RunStarted { run_id, .. }
            | FlowEvent::RunCompleted { run_id, .. }
            | FlowEvent::RunFailed { run_id, .. }
            | FlowEvent::RunCancelled { run_id, .. }
            | FlowEvent::StepStarted { run_id, .. }
            | FlowEvent::StepCompleted { run_id, .. }
            | FlowEvent::StepFailed { run_id, .. }
            | FlowEvent::StepRetrying { run_id, .. } => *run_id,
        }
    }

    /// The step id, for step-level events.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            FlowEvent::StepStarted { step_id, .. }
            | FlowEvent::StepCompleted { step_id, .. }
            | FlowEvent::StepFailed { step_id, .. }
            | FlowEvent::StepRetrying { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}
