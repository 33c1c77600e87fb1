//! Flow domain types for stepflow.
//!
//! Defines the canonical representation of a declarative flow: the YAML
//! document deserializes straight into `FlowDefinition`, which is immutable
//! once validated and shared read-only across concurrent executions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// A complete flow: inputs schema, step tree, output bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Flow name (alphanumeric, hyphens, underscores).
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Ordered input schema.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputSpec>,
    /// Top-level steps, executed in document order.
    pub steps: Vec<StepDefinition>,
    /// Ordered output bindings. Only these names ever appear in a result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputBinding>,
    /// Steps executed best-effort when the run is cancelled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_cancel: Vec<StepDefinition>,
}

impl FlowDefinition {
    /// Look up an input declaration by name.
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Whether `name` is a declared output.
    pub fn declares_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o.name == name)
    }
}

/// A single declared flow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    /// Value used when the caller omits the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Type tag for a declared input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl InputType {
    /// Whether `value` satisfies this type tag. `null` only satisfies `any`.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Integer => value.is_i64() || value.is_u64(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
            InputType::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Integer => "integer",
            InputType::Boolean => "boolean",
            InputType::Array => "array",
            InputType::Object => "object",
            InputType::Any => "any",
        }
    }
}

/// Maps a flow output name to the expression producing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBinding {
    pub name: String,
    /// Source expression, e.g. `${fetch.order.total}`.
    pub value: String,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A node in the flow's step tree.
///
/// The common fields live on this struct; the variant-specific payload is
/// flattened from `kind`, internally tagged by `type`:
/// ```yaml
/// - id: fetch
///   type: task
///   task: fetch_order
///   inputs: { id: "${inputs.order_id}" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the enclosing step list. Inside a `for_each` body the
    /// id may template the loop variable (`process_${item.id}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Handler steps run when the step fails (after retries are exhausted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Vec<StepDefinition>>,
    /// Which produced keys are externally visible. `None` keeps all keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl StepDefinition {
    /// Build a step of the given kind with no common fields set.
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: None,
            retry: None,
            on_error: None,
            outputs: None,
            kind,
        }
    }

    /// Builder-style id assignment.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The id this step stores its output under, before template expansion.
    ///
    /// Task steps default to the task name and subflow steps to the flow
    /// name; every other kind defaults to `<kind>_<position>`.
    pub fn effective_id(&self, position: usize) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        match &self.kind {
            StepKind::Task { task, .. } => task.clone(),
            StepKind::Subflow { flow, .. } => flow.clone(),
            other => format!("{}_{}", other.kind_name(), position),
        }
    }
}

/// Variant-specific step payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a named task through the task invoker.
    Task {
        task: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        inputs: Map<String, Value>,
    },
    /// If/else guard clause. Sibling steps run regardless of the branch.
    Conditional {
        condition: Condition,
        #[serde(rename = "then", default)]
        then_steps: Vec<StepDefinition>,
        #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
        else_steps: Option<Vec<StepDefinition>>,
    },
    /// Select the first case whose match value(s) contain the subject.
    Switch {
        subject: Value,
        cases: Vec<SwitchCase>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Vec<StepDefinition>>,
    },
    /// Independent step lists executed concurrently (wait-all).
    Parallel {
        branches: Vec<Vec<StepDefinition>>,
    },
    /// Execute `steps` once per element of `items`.
    ForEach {
        /// Expression or literal list.
        items: Value,
        #[serde(rename = "as", default = "default_loop_var")]
        var: String,
        #[serde(default, skip_serializing_if = "is_false")]
        parallel: bool,
        steps: Vec<StepDefinition>,
    },
    /// Call another flow with an isolated child context.
    Subflow {
        flow: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        inputs: Map<String, Value>,
    },
    /// Terminate the whole flow successfully.
    Exit {
        #[serde(default)]
        reason: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        outputs: Map<String, Value>,
    },
}

impl StepKind {
    /// Snake-case kind name, as written in YAML.
    pub fn kind_name(&self) -> &'static str {
        match self {
            StepKind::Task { .. } => "task",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Switch { .. } => "switch",
            StepKind::Parallel { .. } => "parallel",
            StepKind::ForEach { .. } => "for_each",
            StepKind::Subflow { .. } => "subflow",
            StepKind::Exit { .. } => "exit",
        }
    }
}

fn default_loop_var() -> String {
    "item".to_string()
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One arm of a `switch` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    /// A single value (equality) or a list (membership).
    #[serde(rename = "match")]
    pub matches: Value,
    pub steps: Vec<StepDefinition>,
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A boolean condition: a comparison string or a quantified combinator.
///
/// ```yaml
/// condition:
///   any:
///     - "${inputs.x} > 3"
///     - none: ["${inputs.flag}"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    AnyOf { any: Vec<Condition> },
    AllOf { all: Vec<Condition> },
    NoneOf { none: Vec<Condition> },
    Literal(bool),
    Expr(String),
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff.
///
/// The delay after failed attempt `n` (0-indexed) is
/// `initial_delay * backoff_multiplier^n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms", alias = "delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier", alias = "backoff")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            backoff_multiplier,
        }
    }

    /// Delay slept after failed attempt `n` (0-indexed).
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(n.min(i32::MAX as u32) as i32);
        let nanos = self.initial_delay_ms as f64 * 1_000_000.0 * factor;
        if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            return Duration::from_nanos(u64::MAX);
        }
        Duration::from_nanos(nanos.round().max(0.0) as u64)
    }

    /// Sum of all delays when every attempt fails (no sleep after the last).
    pub fn total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|n| self.delay_for_attempt(n))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
