//! JEXL expressions for conditions, loop collections, output transforms and
//! subskill context mappings.
//!
//! Expressions are parsed once when a skill is compiled. The parsed tree is
//! walked against an allowlist: literals, lists, variable lookups with dotted
//! and indexed paths, binary operators (comparison, `in`, arithmetic, `&&`,
//! `||`) and the transforms registered below. Object literals, ternaries,
//! filters and unknown transforms are rejected before a skill is stored.
//!
//! Evaluation goes through `jexl_eval::Evaluator`. The context passed to it
//! holds only the variables the expression names; missing ones are `null`.
//! Null checks are written `x == null` / `x != null`, negation `(x)|not`.

use std::collections::HashMap;
use std::fmt;

use jexl_parser::Parser;
use jexl_parser::ast::Expression;
use serde_json::{Map, Value, json};

/// Deepest expression tree accepted.
pub const MAX_DEPTH: usize = 64;

/// Longest expression source accepted, in bytes.
pub const MAX_SOURCE_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("expression nested too deeply (limit {MAX_DEPTH})")]
    TooDeep,

    #[error("expression longer than {MAX_SOURCE_LEN} bytes")]
    TooLong,

    #[error("unknown transform '{0}'")]
    UnknownTransform(String),

    #[error("transform '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: &'static str,
        got: usize,
    },

    #[error("{0} are not allowed in skill expressions")]
    Disallowed(&'static str),

    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Variable source an expression is evaluated against.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl Scope for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Scope for Map<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// A scope with one extra binding layered over another scope.
pub struct Bound<'a, S: Scope + ?Sized> {
    pub inner: &'a S,
    pub name: &'a str,
    pub value: &'a Value,
}

impl<S: Scope + ?Sized> Scope for Bound<'_, S> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        if name == self.name {
            Some(self.value)
        } else {
            self.inner.lookup(name)
        }
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Registered transforms with their argument bounds, subject excluded.
const TRANSFORMS: &[(&str, usize, usize)] = &[
    ("lower", 0, 0),
    ("upper", 0, 0),
    ("trim", 0, 0),
    ("split", 0, 1),
    ("not", 0, 0),
    ("contains", 1, 1),
    ("startsWith", 1, 1),
    ("endsWith", 1, 1),
    ("match", 1, 1),
    ("length", 0, 0),
    ("default", 1, 1),
    ("keys", 0, 0),
    ("values", 0, 0),
    ("abs", 0, 0),
    ("round", 0, 1),
    ("number", 0, 0),
    ("string", 0, 0),
];

fn arg_str(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

fn arg_f64(args: &[Value], index: usize) -> Option<f64> {
    args.get(index).and_then(|v| v.as_f64())
}

fn skill_evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("lower", |args: &[Value]| {
            Ok(json!(arg_str(args, 0).to_lowercase()))
        })
        .with_transform("upper", |args: &[Value]| {
            Ok(json!(arg_str(args, 0).to_uppercase()))
        })
        .with_transform("trim", |args: &[Value]| Ok(json!(arg_str(args, 0).trim())))
        .with_transform("split", |args: &[Value]| {
            let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
            let parts: Vec<&str> = arg_str(args, 0).split(delimiter).collect();
            Ok(json!(parts))
        })
        .with_transform("not", |args: &[Value]| {
            Ok(json!(!args.first().is_some_and(value_to_bool)))
        })
        .with_transform("contains", |args: &[Value]| {
            let found = match (args.first(), args.get(1)) {
                (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                _ => arg_str(args, 0).contains(arg_str(args, 1)),
            };
            Ok(json!(found))
        })
        .with_transform("startsWith", |args: &[Value]| {
            Ok(json!(arg_str(args, 0).starts_with(arg_str(args, 1))))
        })
        .with_transform("endsWith", |args: &[Value]| {
            Ok(json!(arg_str(args, 0).ends_with(arg_str(args, 1))))
        })
        // Substring match, not a regex
        .with_transform("match", |args: &[Value]| {
            Ok(json!(arg_str(args, 0).contains(arg_str(args, 1))))
        })
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
        .with_transform("default", |args: &[Value]| {
            Ok(match args.first() {
                Some(v) if !v.is_null() => v.clone(),
                _ => args.get(1).cloned().unwrap_or(Value::Null),
            })
        })
        .with_transform("keys", |args: &[Value]| {
            Ok(match args.first() {
                Some(Value::Object(map)) => json!(map.keys().collect::<Vec<_>>()),
                _ => json!([]),
            })
        })
        .with_transform("values", |args: &[Value]| {
            Ok(match args.first() {
                Some(Value::Object(map)) => json!(map.values().collect::<Vec<_>>()),
                _ => json!([]),
            })
        })
        .with_transform("abs", |args: &[Value]| {
            Ok(arg_f64(args, 0).map_or(Value::Null, |n| json!(n.abs())))
        })
        .with_transform("round", |args: &[Value]| {
            let factor = 10f64.powi(arg_f64(args, 1).unwrap_or(0.0) as i32);
            Ok(arg_f64(args, 0).map_or(Value::Null, |n| json!((n * factor).round() / factor)))
        })
        .with_transform("number", |args: &[Value]| {
            Ok(match args.first() {
                Some(Value::Number(n)) => json!(n.as_f64()),
                Some(Value::String(s)) => s.trim().parse::<f64>().map_or(Value::Null, |n| json!(n)),
                Some(Value::Bool(b)) => json!(if *b { 1.0 } else { 0.0 }),
                _ => Value::Null,
            })
        })
        .with_transform("string", |args: &[Value]| {
            Ok(match args.first() {
                Some(Value::String(s)) => json!(s),
                None | Some(Value::Null) => json!(""),
                Some(other) => json!(integral(other.clone()).to_string()),
            })
        })
}

thread_local! {
    static EVALUATOR: jexl_eval::Evaluator<'static> = skill_evaluator();
}

// ---------------------------------------------------------------------------
// Allowlist walk
// ---------------------------------------------------------------------------

/// Deepest bracket nesting in `source`, ignoring string literals.
fn bracket_depth(source: &str) -> usize {
    let (mut depth, mut max) = (0usize, 0usize);
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in source.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => {
                depth += 1;
                max = max.max(depth);
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

fn check_transform(name: &str, args: usize) -> Result<(), ExpressionError> {
    let &(_, min, max) = TRANSFORMS
        .iter()
        .find(|(known, ..)| *known == name)
        .ok_or_else(|| ExpressionError::UnknownTransform(name.to_string()))?;
    if args < min || args > max {
        let expected = match (min, max) {
            (0, 0) => "no",
            (1, 1) => "exactly 1",
            (0, 1) => "at most 1",
            _ => "a different number of",
        };
        return Err(ExpressionError::Arity {
            name: name.to_string(),
            expected,
            got: args,
        });
    }
    Ok(())
}

/// Check `node` against the allowlist and collect the variables it reads.
fn walk(node: &Expression, depth: usize, names: &mut Vec<String>) -> Result<(), ExpressionError> {
    if depth > MAX_DEPTH {
        return Err(ExpressionError::TooDeep);
    }
    match node {
        Expression::Number(_)
        | Expression::String(_)
        | Expression::Boolean(_)
        | Expression::Null => Ok(()),
        Expression::Identifier(name) => {
            if !names.contains(name) {
                names.push(name.clone());
            }
            Ok(())
        }
        Expression::Array(items) => items
            .iter()
            .try_for_each(|item| walk(item, depth + 1, names)),
        Expression::BinaryOperation { left, right, .. } => {
            walk(left, depth + 1, names)?;
            walk(right, depth + 1, names)
        }
        Expression::DotOperation { subject, .. } => walk(subject, depth + 1, names),
        Expression::IndexOperation { subject, index, .. } => {
            walk(subject, depth + 1, names)?;
            walk(index, depth + 1, names)
        }
        Expression::Transform {
            name,
            subject,
            args,
            ..
        } => {
            let args: Vec<&Expression> = args.iter().flatten().map(|a| &**a).collect();
            check_transform(name, args.len())?;
            walk(subject, depth + 1, names)?;
            args.into_iter().try_for_each(|a| walk(a, depth + 1, names))
        }
        Expression::Object(_) => Err(ExpressionError::Disallowed("object literals")),
        _ => Err(ExpressionError::Disallowed("ternaries and filters")),
    }
}

// ---------------------------------------------------------------------------
// CompiledExpression
// ---------------------------------------------------------------------------

/// A parsed, allowlisted expression ready for repeated evaluation.
#[derive(Clone, PartialEq)]
pub struct CompiledExpression {
    source: String,
    /// Top-level variables the expression reads.
    variables: Vec<String>,
}

impl fmt::Debug for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompiledExpression").field(&self.source).finish()
    }
}

impl fmt::Display for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl CompiledExpression {
    /// Parse and validate an expression.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        if source.trim().is_empty() {
            return Err(ExpressionError::Syntax("empty expression".to_string()));
        }
        if source.len() > MAX_SOURCE_LEN {
            return Err(ExpressionError::TooLong);
        }
        // The parser builds one tree level per bracket; refuse before parsing
        if bracket_depth(source) > MAX_DEPTH {
            return Err(ExpressionError::TooDeep);
        }

        let ast = Parser::parse(source).map_err(|e| ExpressionError::Syntax(e.to_string()))?;
        let mut variables = Vec::new();
        walk(&ast, 0, &mut variables)?;

        Ok(Self {
            source: source.to_string(),
            variables,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Variables read by the expression, in first-use order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Evaluate to a JSON value. Missing variables are `null`.
    pub fn evaluate(&self, scope: &(impl Scope + ?Sized)) -> Result<Value, ExpressionError> {
        let context: Map<String, Value> = self
            .variables
            .iter()
            .map(|name| {
                let value = scope.lookup(name).map_or(Value::Null, fractional);
                (name.clone(), value)
            })
            .collect();
        let context = Value::Object(context);

        EVALUATOR
            .with(|evaluator| {
                evaluator
                    .eval_in_context(&self.source, &context)
                    .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
            })
            .map(integral)
    }

    /// Evaluate as a condition. Never fails: runtime errors are logged and
    /// read as `false`.
    pub fn evaluate_bool(&self, scope: &(impl Scope + ?Sized)) -> bool {
        match self.evaluate(scope) {
            Ok(value) => value_to_bool(&value),
            Err(e) => {
                tracing::warn!(expression = %self.source, error = %e, "condition evaluation failed, treating as false");
                false
            }
        }
    }

    /// Evaluate as a loop collection. Never fails: non-iterable results and
    /// runtime errors yield an empty list. Objects iterate as `{key, value}`.
    pub fn evaluate_items(&self, scope: &(impl Scope + ?Sized)) -> Vec<Value> {
        match self.evaluate(scope) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Object(map)) => map
                .into_iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect(),
            Ok(Value::Null) => Vec::new(),
            Ok(other) => {
                tracing::warn!(expression = %self.source, value = %other, "loop collection is not iterable, using empty list");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(expression = %self.source, error = %e, "loop collection evaluation failed, using empty list");
                Vec::new()
            }
        }
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness, except
/// that empty lists and objects are false.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Number normalization
// ---------------------------------------------------------------------------

/// JEXL numbers are floats; integers in the context become floats so that
/// `count == 3` compares equal.
fn fractional(value: &Value) -> Value {
    match value {
        Value::Number(n) if !n.is_f64() => n.as_f64().map_or(Value::Null, |f| json!(f)),
        Value::Array(items) => Value::Array(items.iter().map(fractional).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), fractional(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Integral floats in a result become JSON integers.
fn integral(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => json!(f as i64),
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(integral).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, integral(v))).collect())
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
