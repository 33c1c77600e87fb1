//! Condition evaluation: comparisons and `any`/`all`/`none` quantifiers.
//!
//! A string condition has the shape `<operand> [<op> <operand>]`. Operands
//! are `${...}` templates or literals. Without an operator the operand's
//! truthiness decides. Quantifiers short-circuit and nest arbitrarily.

use std::cmp::Ordering;

use serde_json::Value;
use stepflow_types::flow::Condition;

use super::expression::{ExpressionError, Template, parse_literal};
use super::resolver::{ResolveError, VariableLookup, is_truthy, resolve_str, type_name};

// ---------------------------------------------------------------------------
// Comparison AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Text containing at least one `${...}`; resolved at evaluation time.
    Template(String),
    Literal(Value),
}

impl Operand {
    fn parse(input: &str, raw: &str) -> Result<Self, ExpressionError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ExpressionError {
                input: input.to_string(),
                reason: "missing operand".to_string(),
            });
        }
        let template = Template::parse(raw).map_err(|e| ExpressionError {
            input: input.to_string(),
            reason: e.reason,
        })?;
        if template.has_expressions() {
            Ok(Operand::Template(raw.to_string()))
        } else {
            Ok(Operand::Literal(parse_literal(raw)))
        }
    }

    fn resolve(&self, scope: &dyn VariableLookup) -> Result<Value, ResolveError> {
        match self {
            Operand::Template(text) => resolve_str(text, scope),
            Operand::Literal(v) => Ok(v.clone()),
        }
    }
}

/// A parsed string condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub text: String,
    pub left: Operand,
    pub op: Option<(CompareOp, Operand)>,
}

impl Comparison {
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let ops = find_operators(input)?;
        match ops.as_slice() {
            [] => Ok(Self {
                text: input.to_string(),
                left: Operand::parse(input, input)?,
                op: None,
            }),
            [(pos, op)] => {
                let width = op.as_str().len();
                Ok(Self {
                    text: input.to_string(),
                    left: Operand::parse(input, &input[..*pos])?,
                    op: Some((*op, Operand::parse(input, &input[pos + width..])?)),
                })
            }
            _ => Err(ExpressionError {
                input: input.to_string(),
                reason: "only one comparison operator is allowed".to_string(),
            }),
        }
    }

    pub fn evaluate(&self, scope: &dyn VariableLookup) -> Result<bool, ResolveError> {
        let left = self.left.resolve(scope)?;
        let Some((op, right)) = &self.op else {
            return Ok(is_truthy(&left));
        };
        let right = right.resolve(scope)?;
        match op {
            CompareOp::Eq => Ok(values_equal(&left, &right)),
            CompareOp::Ne => Ok(!values_equal(&left, &right)),
            ordering_op => {
                let ord = compare_values(&left, &right).ok_or_else(|| {
                    ResolveError::TypeMismatch {
                        reference: self.text.clone(),
                        reason: format!(
                            "cannot order {} and {}",
                            type_name(&left),
                            type_name(&right)
                        ),
                    }
                })?;
                Ok(match ordering_op {
                    CompareOp::Lt => ord == Ordering::Less,
                    CompareOp::Gt => ord == Ordering::Greater,
                    CompareOp::Le => ord != Ordering::Greater,
                    _ => ord != Ordering::Less,
                })
            }
        }
    }
}

/// Locate top-level comparison operators, skipping `${...}` and quoted text.
fn find_operators(input: &str) -> Result<Vec<(usize, CompareOp)>, ExpressionError> {
    let bytes = input.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut in_expr = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if in_expr {
            match c {
                b'"' | b'\'' => quote = Some(c),
                b'}' => in_expr = false,
                _ => {}
            }
            i += 1;
            continue;
        }
        match c {
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                in_expr = true;
                i += 2;
                continue;
            }
            b'"' | b'\'' => {
                quote = Some(c);
                i += 1;
                continue;
            }
            _ => {}
        }

        let next = bytes.get(i + 1).copied();
        let op = match (c, next) {
            (b'=', Some(b'=')) => Some((CompareOp::Eq, 2)),
            (b'!', Some(b'=')) => Some((CompareOp::Ne, 2)),
            (b'<', Some(b'=')) => Some((CompareOp::Le, 2)),
            (b'>', Some(b'=')) => Some((CompareOp::Ge, 2)),
            (b'<', _) => Some((CompareOp::Lt, 1)),
            (b'>', _) => Some((CompareOp::Gt, 1)),
            (b'=', _) => {
                return Err(ExpressionError {
                    input: input.to_string(),
                    reason: "single `=` is not a comparison, use `==`".to_string(),
                });
            }
            _ => None,
        };
        match op {
            Some((op, width)) => {
                found.push((i, op));
                i += width;
            }
            None => i += 1,
        }
    }
    Ok(found)
}

/// JSON equality with numeric normalisation (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Stateless evaluator for [`Condition`] trees.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate a condition against a scope.
    pub fn evaluate(cond: &Condition, scope: &dyn VariableLookup) -> Result<bool, ResolveError> {
        match cond {
            Condition::Literal(b) => Ok(*b),
            Condition::Expr(text) => Comparison::parse(text)?.evaluate(scope),
            Condition::AnyOf { any } => {
                for c in any {
                    if Self::evaluate(c, scope)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::AllOf { all } => {
                for c in all {
                    if !Self::evaluate(c, scope)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::NoneOf { none } => {
                for c in none {
                    if Self::evaluate(c, scope)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Syntax-check every comparison in the tree.
    pub fn validate(cond: &Condition) -> Result<(), ExpressionError> {
        match cond {
            Condition::Literal(_) => Ok(()),
            Condition::Expr(text) => Comparison::parse(text).map(|_| ()),
            Condition::AnyOf { any: list }
            | Condition::AllOf { all: list }
            | Condition::NoneOf { none: list } => list.iter().try_for_each(Self::validate),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
