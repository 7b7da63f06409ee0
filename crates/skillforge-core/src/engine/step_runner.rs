//! Step runner for the non-structural step types.
//!
//! `StepRunner` executes one step against the context store and returns a
//! `StepOutcome` telling the engine how to move the cursor. Operation steps
//! (tool_call, action, ai_decision) go through the retry policy, the
//! operation limit, the remaining time budget and the operation log.
//! Subskill steps need the engine itself and are run there.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use skillforge_types::error::{ToolError, ToolErrorKind};
use skillforge_types::execution::{
    Execution, LoopFrame, OperationLogEntry, OperationState, OperationType, PendingInput,
};
use skillforge_types::skill::{InputType, StepDefinition, StepKind};
use uuid::Uuid;

use crate::repository::execution::ExecutionRepository;
use crate::rollback::ExecutionEnv;
use crate::skill::definition::StepProgram;

use super::checkpoint::CheckpointManager;
use super::context::ContextStore;
use super::expression::{Bound, value_to_bool};
use super::retry::RetryPolicy;
use super::tool::{StepResolver, ToolInvoker};

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// How the cursor moves after a successful step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Advance to the next step in the current scope.
    Continue,
    /// Move to the named step in the current scope.
    Jump(String),
    /// Skip the step after this one.
    SkipNext,
    /// Suspend the execution until input arrives.
    Suspend(PendingInput),
    /// Start iterating a loop body.
    EnterLoop(LoopFrame),
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    Tool(ToolErrorKind),
    Template,
    Validation,
    /// The user declined a confirmation.
    Declined,
    Subskill,
    LoopLimit,
    OperationLimit,
    /// The execution's time budget ran out during the step.
    Timeout,
    Context,
    Internal,
}

/// A run-time step failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("step '{step_id}' failed: {message}")]
pub struct StepError {
    pub step_id: String,
    pub kind: StepErrorKind,
    pub message: String,
    /// Copied from the step definition.
    pub critical: bool,
}

impl StepError {
    pub fn new(step: &StepDefinition, kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            step_id: step.id.clone(),
            kind,
            message: message.into(),
            critical: step.is_critical,
        }
    }

    pub(crate) fn internal(step: &StepDefinition, message: impl Into<String>) -> Self {
        Self::new(step, StepErrorKind::Internal, message)
    }

    /// Whether the failure ends the execution. Limits and timeouts do
    /// regardless of the step's criticality.
    pub fn is_fatal(&self) -> bool {
        self.critical
            || matches!(
                self.kind,
                StepErrorKind::OperationLimit | StepErrorKind::Timeout | StepErrorKind::Internal
            )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == StepErrorKind::Timeout
    }
}

// ---------------------------------------------------------------------------
// StepScope
// ---------------------------------------------------------------------------

/// Everything a step may read or mutate.
pub struct StepScope<'a> {
    pub execution: &'a mut Execution,
    pub ctx: &'a mut ContextStore,
    pub env: &'a ExecutionEnv,
    /// End of the execution's time budget.
    pub deadline: Option<tokio::time::Instant>,
    pub max_operations: Option<u32>,
    pub max_loop_iterations: usize,
}

/// One external call made by an operation step.
enum Operation<'s> {
    Tool(&'s str),
    Action(&'s str),
    Decide { prompt: String, options: &'s [String] },
}

impl Operation<'_> {
    fn name(&self) -> &str {
        match self {
            Operation::Tool(name) | Operation::Action(name) => name,
            Operation::Decide { .. } => "ai_decision",
        }
    }

    fn operation_type(&self) -> OperationType {
        match self {
            Operation::Tool(_) => OperationType::ToolCall,
            Operation::Action(_) => OperationType::Action,
            Operation::Decide { .. } => OperationType::Decision,
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes individual steps by dispatching on their kind.
pub struct StepRunner<E: ExecutionRepository> {
    checkpoint: Arc<CheckpointManager<E>>,
    tools: Arc<dyn ToolInvoker>,
    resolver: Option<Arc<dyn StepResolver>>,
}

impl<E: ExecutionRepository> StepRunner<E> {
    pub fn new(checkpoint: Arc<CheckpointManager<E>>, tools: Arc<dyn ToolInvoker>) -> Self {
        Self {
            checkpoint,
            tools,
            resolver: None,
        }
    }

    pub fn set_resolver(&mut self, resolver: Arc<dyn StepResolver>) {
        self.resolver = Some(resolver);
    }

    /// Run a step and return how the cursor should move.
    pub async fn run(
        &self,
        step: &StepDefinition,
        program: &StepProgram,
        scope: &mut StepScope<'_>,
    ) -> Result<StepOutcome, StepError> {
        match &step.kind {
            StepKind::ToolCall {
                tool_id,
                tool_name,
                params_template,
            } => {
                let tool = tool_id
                    .as_deref()
                    .filter(|t| !t.trim().is_empty())
                    .or(tool_name.as_deref())
                    .unwrap_or_default();
                let params = render(step, scope.ctx, params_template.as_deref())?;
                let output = self.operate(step, Operation::Tool(tool), params, scope).await?;
                bind_output(step, program, output, scope.ctx)?;
                Ok(StepOutcome::Continue)
            }
            StepKind::Action {
                action,
                params_template,
            } => {
                let params = render(step, scope.ctx, params_template.as_deref())?;
                let output = self
                    .operate(step, Operation::Action(action), params, scope)
                    .await?;
                bind_output(step, program, output, scope.ctx)?;
                Ok(StepOutcome::Continue)
            }
            StepKind::AiDecision { prompt, options } => {
                let operation = Operation::Decide {
                    prompt: scope.ctx.render_text(prompt),
                    options,
                };
                let output = self.operate(step, operation, Map::new(), scope).await?;
                if !options.is_empty() && !output.as_str().is_some_and(|o| options.iter().any(|opt| opt == o)) {
                    return Err(StepError::new(
                        step,
                        StepErrorKind::Tool(ToolErrorKind::InvalidParams),
                        format!("decision {output} is not one of {options:?}"),
                    ));
                }
                bind_output(step, program, output, scope.ctx)?;
                Ok(StepOutcome::Continue)
            }
            StepKind::Condition {
                on_success_step,
                on_failure_step,
                ..
            } => {
                let predicate = program
                    .predicate
                    .as_ref()
                    .ok_or_else(|| StepError::internal(step, "condition was not compiled"))?;
                let met = predicate.evaluate_bool(&*scope.ctx);
                tracing::debug!(
                    step_id = %step.id,
                    expression = predicate.source(),
                    result = met,
                    "condition evaluated"
                );
                if let Some(variable) = &step.output_variable {
                    set(step, scope.ctx, variable, Value::Bool(met))?;
                }
                Ok(match (met, on_success_step, on_failure_step) {
                    (true, Some(target), _) | (false, _, Some(target)) => {
                        StepOutcome::Jump(target.clone())
                    }
                    (true, None, _) => StepOutcome::Continue,
                    (false, _, None) => StepOutcome::SkipNext,
                })
            }
            StepKind::Validation { message, .. } => {
                let predicate = program
                    .predicate
                    .as_ref()
                    .ok_or_else(|| StepError::internal(step, "validation was not compiled"))?;
                if predicate.evaluate_bool(&*scope.ctx) {
                    return Ok(StepOutcome::Continue);
                }
                let message = match message {
                    Some(m) => scope.ctx.render_text(m),
                    None => format!("validation failed: {}", predicate.source()),
                };
                Err(StepError::new(step, StepErrorKind::Validation, message))
            }
            StepKind::Loop { .. } => {
                let collection = program
                    .collection
                    .as_ref()
                    .ok_or_else(|| StepError::internal(step, "loop was not compiled"))?;
                let items = collection.evaluate_items(&*scope.ctx);
                if items.len() > scope.max_loop_iterations {
                    return Err(StepError::new(
                        step,
                        StepErrorKind::LoopLimit,
                        format!(
                            "loop over {} items exceeds the limit of {}",
                            items.len(),
                            scope.max_loop_iterations
                        ),
                    ));
                }
                tracing::debug!(step_id = %step.id, items = items.len(), "entering loop");
                Ok(StepOutcome::EnterLoop(LoopFrame {
                    step_id: step.id.clone(),
                    items,
                    index: 0,
                    body_position: 0,
                }))
            }
            StepKind::UserInput {
                prompt,
                input_type,
                options,
                variable,
            } => {
                if std::mem::take(&mut scope.execution.input_satisfied) {
                    return Ok(StepOutcome::Continue);
                }
                Ok(StepOutcome::Suspend(PendingInput {
                    prompt: scope.ctx.render_text(prompt),
                    input_type: *input_type,
                    options: options.clone(),
                    variable: variable.clone(),
                    step_id: step.id.clone(),
                    child_execution_id: None,
                }))
            }
            StepKind::Confirmation { prompt, variable } => {
                if std::mem::take(&mut scope.execution.input_satisfied) {
                    let confirmed = scope.ctx.get(variable).is_some_and(value_to_bool);
                    return if confirmed {
                        Ok(StepOutcome::Continue)
                    } else {
                        Err(StepError::new(
                            step,
                            StepErrorKind::Declined,
                            "confirmation declined",
                        ))
                    };
                }
                Ok(StepOutcome::Suspend(PendingInput {
                    prompt: scope.ctx.render_text(prompt),
                    input_type: InputType::Boolean,
                    options: Vec::new(),
                    variable: variable.clone(),
                    step_id: step.id.clone(),
                    child_execution_id: None,
                }))
            }
            StepKind::Subskill { .. } => Err(StepError::internal(
                step,
                "subskill steps are run by the execution engine",
            )),
        }
    }

    /// Invoke an operation under the retry policy, the operation limit and
    /// the time budget. Every attempt is written to the operation log.
    async fn operate(
        &self,
        step: &StepDefinition,
        operation: Operation<'_>,
        params: Map<String, Value>,
        scope: &mut StepScope<'_>,
    ) -> Result<Value, StepError> {
        let policy = RetryPolicy::for_step(step);
        let mut attempt = 1;

        loop {
            if let Some(max) = scope.max_operations
                && scope.execution.operation_count >= max
            {
                return Err(StepError::new(
                    step,
                    StepErrorKind::OperationLimit,
                    format!("operation limit of {max} reached"),
                ));
            }
            scope.execution.operation_count += 1;

            let started = Instant::now();
            let call = self.call(&operation, params.clone(), &*scope.ctx, scope.env);
            let (result, budget_exhausted) = match scope.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
                    Ok(result) => (result, false),
                    Err(_) => (
                        Err(ToolError::new(
                            ToolErrorKind::Timeout,
                            "execution time budget exhausted",
                        )),
                        true,
                    ),
                },
                None => (call.await, false),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            self.record(step, &operation, &params, &result, attempt, duration_ms, scope.execution.id)
                .await?;

            let error = match result {
                Ok(output) => return Ok(output),
                Err(e) if budget_exhausted => {
                    return Err(StepError::new(step, StepErrorKind::Timeout, e.message));
                }
                Err(e) => e,
            };

            let remaining = scope
                .deadline
                .map(|d| d.saturating_duration_since(tokio::time::Instant::now()));
            if policy.should_retry(attempt) && policy.delay_fits(remaining) {
                tracing::warn!(
                    step_id = %step.id,
                    operation = operation.name(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %error,
                    "operation failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
                continue;
            }

            return Err(StepError::new(
                step,
                StepErrorKind::Tool(error.kind),
                error.to_string(),
            ));
        }
    }

    async fn call(
        &self,
        operation: &Operation<'_>,
        params: Map<String, Value>,
        ctx: &ContextStore,
        env: &ExecutionEnv,
    ) -> Result<Value, ToolError> {
        match operation {
            Operation::Tool(tool) => self.tools.invoke(tool, params, env).await,
            Operation::Action(action) => match &self.resolver {
                Some(resolver) => resolver.resolve_action(action, params, ctx, env).await,
                None => Err(ToolError::new(
                    ToolErrorKind::NotFound,
                    format!("no step resolver configured for action '{action}'"),
                )),
            },
            Operation::Decide { prompt, options } => match &self.resolver {
                Some(resolver) => resolver.decide(prompt, options, ctx).await,
                None => Err(ToolError::new(
                    ToolErrorKind::NotFound,
                    "no step resolver configured for decisions",
                )),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        step: &StepDefinition,
        operation: &Operation<'_>,
        params: &Map<String, Value>,
        result: &Result<Value, ToolError>,
        attempt: u32,
        duration_ms: u64,
        execution_id: Uuid,
    ) -> Result<(), StepError> {
        let entry = OperationLogEntry {
            id: Uuid::now_v7(),
            execution_id,
            step_id: step.id.clone(),
            tool_name: operation.name().to_string(),
            operation_type: operation.operation_type(),
            parameters: Value::Object(params.clone()),
            result: result.as_ref().ok().cloned(),
            error_message: result.as_ref().err().map(ToString::to_string),
            state: if result.is_ok() {
                OperationState::Success
            } else {
                OperationState::Failed
            },
            attempt,
            duration_ms,
            created_at: Utc::now(),
        };
        self.checkpoint
            .log_operation(&entry)
            .await
            .map_err(|e| StepError::internal(step, e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn render(
    step: &StepDefinition,
    ctx: &ContextStore,
    template: Option<&str>,
) -> Result<Map<String, Value>, StepError> {
    ctx.render_params(template)
        .map_err(|e| StepError::new(step, StepErrorKind::Template, e.to_string()))
}

fn set(
    step: &StepDefinition,
    ctx: &mut ContextStore,
    key: &str,
    value: Value,
) -> Result<(), StepError> {
    ctx.set(key, value)
        .map_err(|e| StepError::new(step, StepErrorKind::Context, e.to_string()))
}

/// Apply the step's output transform and bind the result to its output
/// variable. A failing transform keeps the raw output.
pub fn bind_output(
    step: &StepDefinition,
    program: &StepProgram,
    output: Value,
    ctx: &mut ContextStore,
) -> Result<(), StepError> {
    let value = match &program.output_transform {
        Some(transform) => {
            let scope = Bound {
                inner: &*ctx,
                name: "output",
                value: &output,
            };
            match transform.evaluate(&scope) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        step_id = %step.id,
                        transform = transform.source(),
                        error = %e,
                        "output transform failed, keeping raw output"
                    );
                    output
                }
            }
        }
        None => output,
    };

    match &step.output_variable {
        Some(variable) => set(step, ctx, variable, value),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
