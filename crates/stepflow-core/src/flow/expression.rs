//! Parser for `${...}` variable expressions and the templates that embed them.
//!
//! Grammar:
//! ```text
//! template  := (literal | "$${" | "${" expr "}")*
//! expr      := root segment* ("|" filter)*
//! segment   := "." ident | "[" int "]" | "[" quoted "]"
//! filter    := ident (":" arg)?
//! ```
//! Parsing is purely syntactic; nothing here looks at a context.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Filters understood by the resolver.
pub const KNOWN_FILTERS: &[&str] = &[
    "length", "exists", "default", "lower", "upper", "trim", "first", "last", "keys", "join",
    "string", "number", "not",
];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A syntactically invalid expression or template.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid expression `{input}`: {reason}")]
pub struct ExpressionError {
    pub input: String,
    pub reason: String,
}

impl ExpressionError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// One step of a path below the root.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Field(String),
    /// Negative indexes count from the end.
    Index(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub name: String,
    pub arg: Option<Value>,
}

/// A parsed `${root.path|filter}` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct VarExpr {
    pub root: String,
    pub path: Vec<PathSegment>,
    pub filters: Vec<Filter>,
}

impl VarExpr {
    /// Parse the text between `${` and `}`.
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let pieces = split_outside_quotes(input, '|');
        let mut pieces = pieces.into_iter();
        let head = pieces.next().unwrap_or_default();
        let (root, path) = parse_path(input, head.trim())?;
        let filters = pieces
            .map(|raw| parse_filter(input, raw.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            root,
            path,
            filters,
        })
    }
}

impl fmt::Display for VarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for seg in &self.path {
            match seg {
                PathSegment::Field(name) if is_ident(name) => write!(f, ".{name}")?,
                PathSegment::Field(name) => write!(f, "[{:?}]", name)?,
                PathSegment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

/// A piece of a template string.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Literal(String),
    Expr(VarExpr),
}

/// A string that may mix literal text with `${...}` expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub parts: Vec<TemplatePart>,
}

impl Template {
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = input;

        while let Some(pos) = rest.find('$') {
            literal.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("$${") {
                literal.push_str("${");
                rest = after;
            } else if let Some(after) = tail.strip_prefix("${") {
                let end = find_closing_brace(after)
                    .ok_or_else(|| ExpressionError::new(input, "unterminated `${`"))?;
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                let inner = &after[..end];
                let expr =
                    VarExpr::parse(inner).map_err(|e| ExpressionError::new(input, e.reason))?;
                parts.push(TemplatePart::Expr(expr));
                rest = &after[end + 1..];
            } else {
                literal.push('$');
                rest = &tail[1..];
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }
        Ok(Self { parts })
    }

    /// The expression when the template is exactly one `${...}` and nothing else.
    pub fn as_single_expr(&self) -> Option<&VarExpr> {
        match self.parts.as_slice() {
            [TemplatePart::Expr(expr)] => Some(expr),
            _ => None,
        }
    }

    pub fn has_expressions(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, TemplatePart::Expr(_)))
    }

    pub fn expressions(&self) -> impl Iterator<Item = &VarExpr> {
        self.parts.iter().filter_map(|p| match p {
            TemplatePart::Expr(expr) => Some(expr),
            TemplatePart::Literal(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_ident_char)
}

/// Index of the `}` closing an expression, skipping quoted text.
fn find_closing_brace(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '}' => return Some(i),
            None => {}
        }
    }
    None
}

fn split_outside_quotes(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == sep => {
                out.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            None => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn parse_path(input: &str, s: &str) -> Result<(String, Vec<PathSegment>), ExpressionError> {
    let root_end = s.find(|c: char| !is_ident_char(c)).unwrap_or(s.len());
    let root = &s[..root_end];
    if root.is_empty() {
        return Err(ExpressionError::new(input, "missing root name"));
    }

    let mut path = Vec::new();
    let mut rest = &s[root_end..];
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(|c: char| !is_ident_char(c)).unwrap_or(after.len());
            if end == 0 {
                return Err(ExpressionError::new(input, "empty field name after `.`"));
            }
            path.push(PathSegment::Field(after[..end].to_string()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = find_closing_bracket(after)
                .ok_or_else(|| ExpressionError::new(input, "unterminated `[`"))?;
            let inner = after[..close].trim();
            path.push(parse_bracket(input, inner)?);
            rest = &after[close + 1..];
        } else {
            return Err(ExpressionError::new(
                input,
                format!("unexpected `{}` in path", rest.chars().next().unwrap_or(' ')),
            ));
        }
    }
    Ok((root.to_string(), path))
}

fn find_closing_bracket(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == ']' => return Some(i),
            None => {}
        }
    }
    None
}

fn parse_bracket(input: &str, inner: &str) -> Result<PathSegment, ExpressionError> {
    if let Some(key) = unquote(inner) {
        return Ok(PathSegment::Field(key));
    }
    inner
        .parse::<i64>()
        .map(PathSegment::Index)
        .map_err(|_| ExpressionError::new(input, format!("invalid index `[{inner}]`")))
}

fn unquote(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    if s.len() >= 2 {
        let (first, last) = (bytes[0], bytes[s.len() - 1]);
        if (first == b'"' || first == b'\'') && first == last {
            return Some(s[1..s.len() - 1].to_string());
        }
    }
    None
}

fn parse_filter(input: &str, raw: &str) -> Result<Filter, ExpressionError> {
    let (name, arg) = match raw.split_once(':') {
        Some((name, arg)) => (name.trim(), Some(parse_literal(arg.trim()))),
        None => (raw, None),
    };
    if !KNOWN_FILTERS.contains(&name) {
        return Err(ExpressionError::new(input, format!("unknown filter `{name}`")));
    }
    if name == "default" && arg.is_none() {
        return Err(ExpressionError::new(input, "`default` requires an argument"));
    }
    Ok(Filter {
        name: name.to_string(),
        arg,
    })
}

/// Interpret a literal: JSON when it parses, a quoted string, or the raw text.
pub fn parse_literal(s: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(s) {
        return v;
    }
    match unquote(s) {
        Some(inner) => Value::String(inner),
        None => Value::String(s.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_root_fields_and_indexes() {
        let expr = VarExpr::parse("fetch.order.lines[0].sku").unwrap();
        assert_eq!(expr.root, "fetch");
        assert_eq!(
            expr.path,
            vec![
                PathSegment::Field("order".into()),
                PathSegment::Field("lines".into()),
                PathSegment::Index(0),
                PathSegment::Field("sku".into()),
            ]
        );
        assert!(expr.filters.is_empty());
    }

    #[test]
    fn parses_quoted_keys_and_negative_index() {
        let expr = VarExpr::parse(r#"inputs["a.b"][-1]"#).unwrap();
        assert_eq!(
            expr.path,
            vec![PathSegment::Field("a.b".into()), PathSegment::Index(-1)]
        );
        assert_eq!(expr.to_string(), r#"inputs["a.b"][-1]"#);
    }

    #[test]
    fn parses_filters_with_arguments() {
        let expr = VarExpr::parse("inputs.tags | join:', ' | upper").unwrap();
        assert_eq!(expr.filters.len(), 2);
        assert_eq!(expr.filters[0].name, "join");
        assert_eq!(expr.filters[0].arg, Some(json!(", ")));
        assert_eq!(expr.filters[1].name, "upper");

        let expr = VarExpr::parse("inputs.limit|default:10").unwrap();
        assert_eq!(expr.filters[0].arg, Some(json!(10)));
    }

    #[test]
    fn rejects_unknown_filter_and_bad_index() {
        assert!(VarExpr::parse("inputs.x|frobnicate").is_err());
        assert!(VarExpr::parse("inputs.x[abc]").is_err());
        assert!(VarExpr::parse(".x").is_err());
        assert!(VarExpr::parse("inputs.").is_err());
        assert!(VarExpr::parse("inputs.x|default").is_err());
    }

    #[test]
    fn template_splits_literals_and_expressions() {
        let t = Template::parse("process_${item.id}").unwrap();
        assert_eq!(t.parts.len(), 2);
        assert_eq!(t.parts[0], TemplatePart::Literal("process_".into()));
        assert!(t.as_single_expr().is_none());

        let t = Template::parse("${inputs.x}").unwrap();
        assert_eq!(t.as_single_expr().map(|e| e.root.as_str()), Some("inputs"));
    }

    #[test]
    fn template_escape_and_lone_dollar() {
        let t = Template::parse("cost: $5, literal $${x}").unwrap();
        assert_eq!(
            t.parts,
            vec![TemplatePart::Literal("cost: $5, literal ${x}".into())]
        );
        assert!(!t.has_expressions());
    }

    #[test]
    fn template_brace_inside_quotes() {
        let t = Template::parse(r#"${inputs["a}b"]}!"#).unwrap();
        let expr = t.expressions().next().unwrap();
        assert_eq!(expr.path, vec![PathSegment::Field("a}b".into())]);
    }

    #[test]
    fn unterminated_template_is_an_error() {
        let err = Template::parse("hello ${inputs.name").unwrap_err();
        assert!(err.reason.contains("unterminated"));
    }

    #[test]
    fn literal_parsing() {
        assert_eq!(parse_literal("42"), json!(42));
        assert_eq!(parse_literal("'ok'"), json!("ok"));
        assert_eq!(parse_literal("shipped"), json!("shipped"));
        assert_eq!(parse_literal("null"), json!(null));
    }
}
