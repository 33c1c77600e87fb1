//! Flow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML documents and `FlowDefinition`, validates structural
//! constraints (names, unique step ids per list, expression syntax, retry
//! bounds), and discovers flow files on disk.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use stepflow_types::flow::{FlowDefinition, StepDefinition, StepKind};
use thiserror::Error;

use super::condition::ConditionEvaluator;
use super::expression::Template;

/// Step ids that would shadow built-in lookup roots.
const RESERVED_IDS: &[&str] = &["inputs", "env", "error"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FlowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `FlowDefinition`.
pub fn parse_flow_yaml(yaml: &str) -> Result<FlowDefinition, FlowError> {
    let def: FlowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| FlowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_flow_yaml(def: &FlowDefinition) -> Result<String, FlowError> {
    serde_yaml_ng::to_string(def).map_err(|e| FlowError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `FlowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, hyphens, underscores
/// - At least one step exists
/// - Input and output names are unique; input defaults match their type
/// - Step ids are unique within each enclosing step list and not reserved
/// - Every template and condition is syntactically valid
/// - Retry policies have `max_attempts >= 1` and `backoff_multiplier >= 1`
pub fn validate_definition(def: &FlowDefinition) -> Result<(), FlowError> {
    if def.name.is_empty() {
        return Err(invalid("flow name must not be empty"));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(format!(
            "flow name '{}' contains invalid characters (only alphanumerics, hyphens and underscores allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(invalid("flow must have at least one step"));
    }

    let mut input_names = HashSet::new();
    for input in &def.inputs {
        if input.name.is_empty() {
            return Err(invalid("input name must not be empty"));
        }
        if !input_names.insert(input.name.as_str()) {
            return Err(invalid(format!("duplicate input: '{}'", input.name)));
        }
        if let Some(default) = &input.default {
            if !input.input_type.accepts(default) {
                return Err(invalid(format!(
                    "default for input '{}' is not of type {}",
                    input.name,
                    input.input_type.as_str()
                )));
            }
        }
    }

    let mut output_names = HashSet::new();
    for output in &def.outputs {
        if !output_names.insert(output.name.as_str()) {
            return Err(invalid(format!("duplicate output: '{}'", output.name)));
        }
        check_template(&output.value, &format!("output '{}'", output.name))?;
    }

    validate_steps(&def.steps, "steps")?;
    validate_steps(&def.on_cancel, "on_cancel")?;
    Ok(())
}

fn validate_steps(steps: &[StepDefinition], location: &str) -> Result<(), FlowError> {
    let mut seen = HashSet::new();
    for (position, step) in steps.iter().enumerate() {
        let id = step.effective_id(position);
        let here = format!("{location}/{id}");

        if id.is_empty() {
            return Err(invalid(format!("{location}: step id must not be empty")));
        }
        if RESERVED_IDS.contains(&id.as_str()) {
            return Err(invalid(format!("{here}: step id '{id}' is reserved")));
        }
        if !seen.insert(id.clone()) {
            return Err(invalid(format!("{location}: duplicate step id '{id}'")));
        }
        check_template(&id, &here)?;

        if let Some(retry) = &step.retry {
            if retry.max_attempts < 1 {
                return Err(invalid(format!("{here}: retry max_attempts must be >= 1")));
            }
            if !(retry.backoff_multiplier >= 1.0) {
                return Err(invalid(format!(
                    "{here}: retry backoff_multiplier must be >= 1"
                )));
            }
        }
        if let Some(handlers) = &step.on_error {
            validate_steps(handlers, &format!("{here}/on_error"))?;
        }

        match &step.kind {
            StepKind::Task { task, inputs } => {
                if task.is_empty() {
                    return Err(invalid(format!("{here}: task name must not be empty")));
                }
                check_map(inputs, &here)?;
            }
            StepKind::Conditional {
                condition,
                then_steps,
                else_steps,
            } => {
                ConditionEvaluator::validate(condition)
                    .map_err(|e| invalid(format!("{here}: {e}")))?;
                validate_steps(then_steps, &format!("{here}/then"))?;
                if let Some(else_steps) = else_steps {
                    validate_steps(else_steps, &format!("{here}/else"))?;
                }
            }
            StepKind::Switch {
                subject,
                cases,
                default,
            } => {
                check_value(subject, &here)?;
                for (i, case) in cases.iter().enumerate() {
                    validate_steps(&case.steps, &format!("{here}/case_{i}"))?;
                }
                if let Some(default) = default {
                    validate_steps(default, &format!("{here}/default"))?;
                }
            }
            StepKind::Parallel { branches } => {
                if branches.is_empty() {
                    return Err(invalid(format!("{here}: parallel needs at least one branch")));
                }
                // Branches share one output map, so ids must be distinct across them.
                let mut branch_ids = HashSet::new();
                for (i, branch) in branches.iter().enumerate() {
                    validate_steps(branch, &format!("{here}/branch_{i}"))?;
                    for (pos, s) in branch.iter().enumerate() {
                        let sid = s.effective_id(pos);
                        if !branch_ids.insert(sid.clone()) {
                            return Err(invalid(format!(
                                "{here}: step id '{sid}' appears in more than one branch"
                            )));
                        }
                    }
                }
            }
            StepKind::ForEach {
                items, var, steps, ..
            } => {
                if var.is_empty() || RESERVED_IDS.contains(&var.as_str()) {
                    return Err(invalid(format!("{here}: invalid loop variable '{var}'")));
                }
                check_value(items, &here)?;
                validate_steps(steps, &format!("{here}/body"))?;
            }
            StepKind::Subflow { flow, inputs } => {
                if flow.is_empty() {
                    return Err(invalid(format!("{here}: subflow name must not be empty")));
                }
                check_map(inputs, &here)?;
            }
            StepKind::Exit { outputs, .. } => check_map(outputs, &here)?,
        }
    }
    Ok(())
}

fn check_template(text: &str, location: &str) -> Result<(), FlowError> {
    Template::parse(text)
        .map(|_| ())
        .map_err(|e| invalid(format!("{location}: {e}")))
}

fn check_value(value: &Value, location: &str) -> Result<(), FlowError> {
    match value {
        Value::String(s) => check_template(s, location),
        Value::Array(items) => items.iter().try_for_each(|v| check_value(v, location)),
        Value::Object(map) => check_map(map, location),
        _ => Ok(()),
    }
}

fn check_map(map: &Map<String, Value>, location: &str) -> Result<(), FlowError> {
    map.values().try_for_each(|v| check_value(v, location))
}

fn invalid(msg: impl Into<String>) -> FlowError {
    FlowError::Validation(msg.into())
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// Every task name referenced anywhere in the flow, including handlers.
pub fn referenced_tasks(def: &FlowDefinition) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    visit_steps(&def.steps, &mut |step| {
        if let StepKind::Task { task, .. } = &step.kind {
            names.insert(task.clone());
        }
    });
    visit_steps(&def.on_cancel, &mut |step| {
        if let StepKind::Task { task, .. } = &step.kind {
            names.insert(task.clone());
        }
    });
    names
}

fn visit_steps(steps: &[StepDefinition], f: &mut dyn FnMut(&StepDefinition)) {
    for step in steps {
        f(step);
        if let Some(handlers) = &step.on_error {
            visit_steps(handlers, f);
        }
        match &step.kind {
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                visit_steps(then_steps, f);
                if let Some(else_steps) = else_steps {
                    visit_steps(else_steps, f);
                }
            }
            StepKind::Switch { cases, default, .. } => {
                for case in cases {
                    visit_steps(&case.steps, f);
                }
                if let Some(default) = default {
                    visit_steps(default, f);
                }
            }
            StepKind::Parallel { branches } => {
                for branch in branches {
                    visit_steps(branch, f);
                }
            }
            StepKind::ForEach { steps, .. } => visit_steps(steps, f),
            StepKind::Task { .. } | StepKind::Subflow { .. } | StepKind::Exit { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

pub fn load_flow_file(path: &Path) -> Result<FlowDefinition, FlowError> {
    let content = std::fs::read_to_string(path)?;
    parse_flow_yaml(&content)
}

/// Save a flow definition to a YAML file, creating parent directories.
pub fn save_flow_file(path: &Path, def: &FlowDefinition) -> Result<(), FlowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_flow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all flow YAML files under `base_dir`, recursively.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_flows(base_dir: &Path) -> Result<Vec<(PathBuf, FlowDefinition)>, FlowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, FlowDefinition)>,
) -> Result<(), FlowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_flow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable flow file"),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
