//! Execution context store with template resolution.
//!
//! `ContextStore` is the mutable key-value state that flows through one
//! execution. Step outputs, user inputs, loop variables and initiating
//! parameters all live here. It serializes to the execution record after
//! every step and is restored from it on resume.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::expression::Scope;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single context value (1 MB).
pub const MAX_VALUE_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("parameter template is not a JSON object: {0}")]
    InvalidTemplate(String),
}

// ---------------------------------------------------------------------------
// ContextStore
// ---------------------------------------------------------------------------

/// Mutable execution state, keyed by variable name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextStore {
    values: HashMap<String, Value>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Resolve a dotted path (`order.partner.name`) through nested objects.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.values.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Store a value. Oversized values are replaced by a truncation marker;
    /// the total size is then checked against `MAX_CONTEXT_SIZE`.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<(), ContextError> {
        let key = key.into();
        let size = serialized_size(&value);

        if size > MAX_VALUE_SIZE {
            tracing::warn!(
                key = %key,
                size,
                max = MAX_VALUE_SIZE,
                "context value exceeds size limit, truncating"
            );
            let marker = serde_json::json!({
                "_truncated": true,
                "_original_size": size,
            });
            self.values.insert(key, marker);
        } else {
            self.values.insert(key, value);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::TooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Merge many values at once (initiating parameters, extracted slots).
    pub fn extend(&mut self, values: impl IntoIterator<Item = (String, Value)>) -> Result<(), ContextError> {
        for (k, v) in values {
            self.set(k, v)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> HashMap<String, Value> {
        self.values
    }

    /// Compute the total serialized size of all context data in bytes.
    pub fn total_size(&self) -> usize {
        self.values.values().map(serialized_size).sum()
    }

    /// Resolve `{name}` placeholders in a tool parameter template and parse
    /// the result as a JSON object.
    ///
    /// Outside JSON strings a placeholder becomes the JSON encoding of the
    /// value (`null` when missing). Inside a JSON string it becomes the
    /// escaped text of the value. An empty template yields `{}`.
    pub fn render_params(&self, template: Option<&str>) -> Result<Map<String, Value>, ContextError> {
        let Some(template) = template.filter(|t| !t.trim().is_empty()) else {
            return Ok(Map::new());
        };

        let mut out = String::with_capacity(template.len());
        let mut in_string = false;
        let mut escaped = false;
        let mut rest = template;

        while let Some(c) = rest.chars().next() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
            } else if c == '"' {
                in_string = true;
            }

            if c == '{' && !escaped {
                if let Some((name, consumed)) = placeholder(rest) {
                    let value = self.get_path(name);
                    if in_string {
                        let text = value.map(display_value).unwrap_or_default();
                        let encoded = Value::String(text).to_string();
                        out.push_str(&encoded[1..encoded.len() - 1]);
                    } else {
                        out.push_str(&value.cloned().unwrap_or(Value::Null).to_string());
                    }
                    rest = &rest[consumed..];
                    continue;
                }
            }

            out.push(c);
            rest = &rest[c.len_utf8()..];
        }

        match serde_json::from_str::<Value>(&out) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(ContextError::InvalidTemplate(format!(
                "resolved to {other} instead of an object"
            ))),
            Err(e) => Err(ContextError::InvalidTemplate(format!("{e} in '{out}'"))),
        }
    }

    /// Resolve `{name}` placeholders in prompt text.
    ///
    /// Unknown references are left as-is (not an error).
    pub fn render_text(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(c) = rest.chars().next() {
            if c == '{' {
                if let Some((name, consumed)) = placeholder(rest) {
                    match self.get_path(name) {
                        Some(value) => out.push_str(&display_value(value)),
                        None => out.push_str(&rest[..consumed]),
                    }
                    rest = &rest[consumed..];
                    continue;
                }
            }
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
        out
    }
}

impl Scope for ContextStore {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// Parse `{ident}` / `{ident.path}` at the start of `s`, returning the name
/// and the number of bytes consumed.
fn placeholder(s: &str) -> Option<(&str, usize)> {
    let inner = s.strip_prefix('{')?;
    let end = inner.find('}')?;
    let name = &inner[..end];
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return None;
    }
    Some((name, end + 2))
}

/// Human-readable rendering: strings unquoted, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
