//! Tool invocation ports and the namespace router.
//!
//! Business entities only reach the engine as named tool calls with JSON
//! parameters and JSON results. `ToolInvoker` is the port a tool backend
//! implements; `StepResolver` handles the opaque `action` and `ai_decision`
//! steps. `ToolRouter` dispatches a tool name to the backend registered for
//! its namespace (the part before the first `.`).

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use skillforge_types::error::{ToolError, ToolErrorKind};

use crate::rollback::ExecutionEnv;

use super::context::ContextStore;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Executes a named side-effecting operation.
pub trait ToolInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        tool: &'a str,
        params: Map<String, Value>,
        env: &'a ExecutionEnv,
    ) -> BoxFuture<'a, Result<Value, ToolError>>;
}

/// Resolves `action` and `ai_decision` steps.
pub trait StepResolver: Send + Sync {
    fn resolve_action<'a>(
        &'a self,
        action: &'a str,
        params: Map<String, Value>,
        context: &'a ContextStore,
        env: &'a ExecutionEnv,
    ) -> BoxFuture<'a, Result<Value, ToolError>>;

    /// Pick one of `options` (or produce a free-form value when empty).
    fn decide<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a [String],
        context: &'a ContextStore,
    ) -> BoxFuture<'a, Result<Value, ToolError>>;
}

// ---------------------------------------------------------------------------
// ToolRouter
// ---------------------------------------------------------------------------

/// Routes tool names to backends by namespace.
///
/// `sql.execute` goes to the backend registered for `sql`. A name without a
/// registered namespace goes to the fallback, if any.
#[derive(Clone, Default)]
pub struct ToolRouter {
    routes: HashMap<String, Arc<dyn ToolInvoker>>,
    fallback: Option<Arc<dyn ToolInvoker>>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A router with the pure `util.*` tools registered.
    pub fn with_builtins() -> Self {
        Self::new().route("util", Arc::new(BuiltinTools))
    }

    pub fn route(mut self, namespace: impl Into<String>, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.routes.insert(namespace.into(), invoker);
        self
    }

    pub fn fallback(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.fallback = Some(invoker);
        self
    }

    pub fn namespaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn backend(&self, tool: &str) -> Option<&Arc<dyn ToolInvoker>> {
        tool.split_once('.')
            .and_then(|(namespace, _)| self.routes.get(namespace))
            .or(self.fallback.as_ref())
    }
}

impl ToolInvoker for ToolRouter {
    fn invoke<'a>(
        &'a self,
        tool: &'a str,
        params: Map<String, Value>,
        env: &'a ExecutionEnv,
    ) -> BoxFuture<'a, Result<Value, ToolError>> {
        match self.backend(tool) {
            Some(backend) => backend.invoke(tool, params, env),
            None => Box::pin(async move { Err(ToolError::not_found(tool)) }),
        }
    }
}

impl std::fmt::Debug for ToolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRouter")
            .field("namespaces", &self.namespaces())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builtin tools
// ---------------------------------------------------------------------------

/// Side-effect-free helper tools under the `util` namespace.
///
/// - `util.echo` returns its parameters unchanged
/// - `util.sum` adds the numbers in `values`
/// - `util.count` returns the length of `items`
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTools;

impl BuiltinTools {
    fn call(tool: &str, params: Map<String, Value>) -> Result<Value, ToolError> {
        match tool {
            "util.echo" => Ok(Value::Object(params)),
            "util.sum" => {
                let values = array_param(&params, "values")?;
                let mut total = 0.0;
                for value in values {
                    total += value.as_f64().ok_or_else(|| {
                        ToolError::new(
                            ToolErrorKind::InvalidParams,
                            format!("util.sum: {value} is not a number"),
                        )
                    })?;
                }
                Ok(json!(total))
            }
            "util.count" => Ok(json!(array_param(&params, "items")?.len())),
            other => Err(ToolError::not_found(other)),
        }
    }
}

fn array_param<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a Vec<Value>, ToolError> {
    params.get(key).and_then(Value::as_array).ok_or_else(|| {
        ToolError::new(
            ToolErrorKind::InvalidParams,
            format!("parameter '{key}' must be an array"),
        )
    })
}

impl ToolInvoker for BuiltinTools {
    fn invoke<'a>(
        &'a self,
        tool: &'a str,
        params: Map<String, Value>,
        _env: &'a ExecutionEnv,
    ) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(async move { Self::call(tool, params) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
