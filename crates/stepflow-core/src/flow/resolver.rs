//! Variable resolution against a layered scope.
//!
//! Resolution is lazy and pure: the same expression evaluated against an
//! unchanged scope always yields the same value, and a reference to a step
//! that has not produced output yet fails instead of reading stale data.

use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::expression::{ExpressionError, Filter, PathSegment, Template, TemplatePart, VarExpr};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error(transparent)]
    InvalidExpression(#[from] ExpressionError),

    /// A referenced scope, step id, field or index does not exist.
    #[error("unresolved reference `{reference}`: {reason}")]
    UnresolvedReference { reference: String, reason: String },

    /// A path segment or filter was applied to the wrong kind of value.
    #[error("type mismatch in `{reference}`: {reason}")]
    TypeMismatch { reference: String, reason: String },
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Supplies root values (`inputs`, `env`, step ids, loop bindings).
pub trait VariableLookup {
    fn lookup(&self, root: &str) -> Option<Value>;
}

impl VariableLookup for Map<String, Value> {
    fn lookup(&self, root: &str) -> Option<Value> {
        self.get(root).cloned()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Evaluate a parsed expression, applying its filters.
pub fn resolve_expr(expr: &VarExpr, scope: &dyn VariableLookup) -> Result<Value, ResolveError> {
    let mut current = walk(expr, scope);
    for filter in &expr.filters {
        current = apply_filter(expr, filter, current);
    }
    current
}

/// Resolve a template string.
///
/// A string that is exactly one `${...}` keeps the resolved value's type;
/// anything else is interpolated into a string.
pub fn resolve_str(s: &str, scope: &dyn VariableLookup) -> Result<Value, ResolveError> {
    let template = Template::parse(s)?;
    if let Some(expr) = template.as_single_expr() {
        return resolve_expr(expr, scope);
    }
    render_template(&template, scope).map(Value::String)
}

/// Recursively resolve every string inside a JSON value.
pub fn resolve_value(value: &Value, scope: &dyn VariableLookup) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => resolve_str(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_map(map, scope).map(Value::Object),
        other => Ok(other.clone()),
    }
}

pub fn resolve_map(
    map: &Map<String, Value>,
    scope: &dyn VariableLookup,
) -> Result<Map<String, Value>, ResolveError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), resolve_value(v, scope)?)))
        .collect()
}

/// Expand a step-id template such as `process_${item.id}` into a concrete key.
pub fn expand_id_template(id: &str, scope: &dyn VariableLookup) -> Result<String, ResolveError> {
    let template = Template::parse(id)?;
    if !template.has_expressions() {
        return Ok(id.to_string());
    }
    render_template(&template, scope)
}

fn render_template(template: &Template, scope: &dyn VariableLookup) -> Result<String, ResolveError> {
    let mut out = String::new();
    for part in &template.parts {
        match part {
            TemplatePart::Literal(text) => out.push_str(text),
            TemplatePart::Expr(expr) => out.push_str(&render(&resolve_expr(expr, scope)?)),
        }
    }
    Ok(out)
}

/// Text form of a value: strings raw, scalars via display, containers as JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Truthiness: null, false, 0, "", [] and {} are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn walk(expr: &VarExpr, scope: &dyn VariableLookup) -> Result<Value, ResolveError> {
    let mut current = scope.lookup(&expr.root).ok_or_else(|| {
        unresolved(
            expr,
            format!("`{}` is not a binding, input, env or completed step", expr.root),
        )
    })?;

    for seg in &expr.path {
        current = match (seg, current) {
            (PathSegment::Field(name), Value::Object(mut map)) => map
                .remove(name)
                .ok_or_else(|| unresolved(expr, format!("no field `{name}`")))?,
            (PathSegment::Field(name), other) => {
                return Err(unresolved(
                    expr,
                    format!("cannot read field `{name}` of {}", type_name(&other)),
                ));
            }
            (PathSegment::Index(i), Value::Array(mut items)) => {
                let len = items.len() as i64;
                let idx = if *i < 0 { len + i } else { *i };
                if idx < 0 || idx >= len {
                    return Err(unresolved(
                        expr,
                        format!("index {i} out of range for length {len}"),
                    ));
                }
                items.swap_remove(idx as usize)
            }
            (PathSegment::Index(i), other) => {
                return Err(mismatch(
                    expr,
                    format!("cannot index {} with [{i}]", type_name(&other)),
                ));
            }
        };
    }
    Ok(current)
}

fn apply_filter(
    expr: &VarExpr,
    filter: &Filter,
    input: Result<Value, ResolveError>,
) -> Result<Value, ResolveError> {
    match filter.name.as_str() {
        "exists" => match input {
            Ok(v) => Ok(Value::Bool(!v.is_null())),
            Err(ResolveError::UnresolvedReference { .. }) => Ok(Value::Bool(false)),
            Err(e) => Err(e),
        },
        "default" => match input {
            Ok(Value::Null) | Err(ResolveError::UnresolvedReference { .. }) => {
                Ok(filter.arg.clone().unwrap_or(Value::Null))
            }
            other => other,
        },
        name => {
            let value = input?;
            apply_value_filter(expr, name, filter.arg.as_ref(), value)
        }
    }
}

fn apply_value_filter(
    expr: &VarExpr,
    name: &str,
    arg: Option<&Value>,
    value: Value,
) -> Result<Value, ResolveError> {
    let wrong = |v: &Value| mismatch(expr, format!("`{name}` cannot apply to {}", type_name(v)));
    match name {
        "length" => match &value {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            other => Err(wrong(other)),
        },
        "lower" | "upper" | "trim" => match &value {
            Value::String(s) => Ok(Value::String(match name {
                "lower" => s.to_lowercase(),
                "upper" => s.to_uppercase(),
                _ => s.trim().to_string(),
            })),
            other => Err(wrong(other)),
        },
        "first" | "last" => match value {
            Value::Array(mut items) => {
                let item = if name == "first" {
                    (!items.is_empty()).then(|| items.swap_remove(0))
                } else {
                    items.pop()
                };
                Ok(item.unwrap_or(Value::Null))
            }
            Value::String(s) => {
                let c = if name == "first" {
                    s.chars().next()
                } else {
                    s.chars().last()
                };
                Ok(c.map(|c| Value::String(c.to_string())).unwrap_or(Value::Null))
            }
            other => Err(wrong(&other)),
        },
        "keys" => match &value {
            Value::Object(map) => Ok(Value::Array(
                map.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            other => Err(wrong(other)),
        },
        "join" => match &value {
            Value::Array(items) => {
                let sep = arg.map(render).unwrap_or_else(|| ",".to_string());
                Ok(Value::String(
                    items.iter().map(render).collect::<Vec<_>>().join(&sep),
                ))
            }
            other => Err(wrong(other)),
        },
        "string" => Ok(Value::String(render(&value))),
        "number" => match &value {
            Value::Number(n) => Ok(Value::Number(n.clone())),
            Value::Bool(b) => Ok(Value::from(u8::from(*b))),
            Value::String(s) => parse_number(s.trim()).ok_or_else(|| {
                mismatch(expr, format!("`{s}` is not a number"))
            }),
            other => Err(wrong(other)),
        },
        "not" => Ok(Value::Bool(!is_truthy(&value))),
        other => Err(ResolveError::InvalidExpression(ExpressionError {
            input: expr.to_string(),
            reason: format!("unknown filter `{other}`"),
        })),
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn unresolved(expr: &VarExpr, reason: String) -> ResolveError {
    ResolveError::UnresolvedReference {
        reference: expr.to_string(),
        reason,
    }
}

fn mismatch(expr: &VarExpr, reason: String) -> ResolveError {
    ResolveError::TypeMismatch {
        reference: expr.to_string(),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
