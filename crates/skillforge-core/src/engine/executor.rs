//! Execution engine: interprets a compiled skill one step at a time.
//!
//! The `ExecutionEngine` owns the state machine of every execution it drives.
//! A drive loop picks the step at the cursor (honouring the loop cursor
//! stack), dispatches it, applies the outcome to the cursor and checkpoints
//! the record. It stops when the skill runs out of steps, a step suspends on
//! user input, a critical step fails, the time budget runs out or the
//! execution is cancelled.
//!
//! # Execution flow
//!
//! 1. `start_execution` resolves the skill, checks the initiating parameters
//!    and creates a `pending` record.
//! 2. `begin` moves it to `running` and opens a rollback point when the
//!    skill asks for one.
//! 3. `drive` dispatches steps until the execution stops.
//! 4. `provide_input` stores the value under the pending variable (or
//!    forwards it to a suspended child) and drives again.
//!
//! Only one worker may advance an execution at a time; a second caller gets
//! `EngineError::Busy`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use serde_json::Value;
use skillforge_types::config::EngineConfig;
use skillforge_types::event::SkillEvent;
use skillforge_types::execution::{
    Execution, ExecutionState, PendingInput, RollbackMode, StepFailure,
};
use skillforge_types::skill::{InputType, Skill, SkillState, StepDefinition, StepKind};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::execution::{ExecutionFilter, ExecutionRepository};
use crate::repository::skill::SkillRepository;
use crate::rollback::{ExecutionEnv, RollbackError, RollbackManager};
use crate::skill::definition::{CompiledSkill, SkillError, StepProgram};
use crate::skill::intent::coerce;
use crate::skill::registry::SkillRegistry;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{ContextError, ContextStore, display_value};
use super::lifecycle::{self, TransitionError};
use super::step_runner::{StepError, StepErrorKind, StepOutcome, StepRunner, StepScope, bind_output};
use super::tool::{StepResolver, ToolInvoker};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by the engine's control operations.
///
/// Step failures are not errors of the caller: they end up on the execution
/// record (`error_message`, `step_errors`) and the call itself succeeds.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("skill '{name}' is {state} and cannot be executed")]
    SkillNotExecutable { name: String, state: SkillState },

    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution {0} is being advanced by another worker")]
    Busy(Uuid),

    #[error("execution exceeded its time budget of {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("rollback failed: {0}")]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    Skill(#[from] SkillError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Checkpoint(CheckpointError),
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::ExecutionNotFound(id) => EngineError::ExecutionNotFound(id),
            other => EngineError::Checkpoint(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters of `start_execution`.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Skill UUID or technical name.
    pub skill: String,
    pub trigger_text: Option<String>,
    /// Initiating parameters, checked against the skill's context schema.
    pub input_data: HashMap<String, Value>,
}

impl StartRequest {
    pub fn new(skill: impl Into<String>) -> Self {
        Self {
            skill: skill.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input_data.insert(key.into(), value);
        self
    }

    pub fn with_trigger_text(mut self, text: impl Into<String>) -> Self {
        self.trigger_text = Some(text.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Internal run state
// ---------------------------------------------------------------------------

/// An execution loaded for driving.
struct Run {
    skill: Arc<CompiledSkill>,
    execution: Execution,
    ctx: ContextStore,
    token: CancellationToken,
}

/// Whether the drive loop keeps dispatching.
enum Flow {
    Continue,
    Stop,
}

/// Releases the worker claim on an execution when dropped.
struct WorkerGuard<'a> {
    workers: &'a DashMap<Uuid, CancellationToken>,
    cancel_reasons: &'a DashMap<Uuid, Option<String>>,
    id: Uuid,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.workers.remove(&self.id);
        self.cancel_reasons.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

/// Interprets skills against their context store.
///
/// Generic over the execution and skill repositories, like the rest of the
/// core, so it runs on SQLite in production and in memory in tests.
pub struct ExecutionEngine<E: ExecutionRepository, S: SkillRepository> {
    checkpoint: Arc<CheckpointManager<E>>,
    registry: Arc<SkillRegistry<S>>,
    runner: StepRunner<E>,
    rollback: Arc<RollbackManager>,
    event_bus: EventBus,
    config: EngineConfig,
    /// Executions currently advanced by a worker, with their cancellation token.
    workers: DashMap<Uuid, CancellationToken>,
    cancel_reasons: DashMap<Uuid, Option<String>>,
}

impl<E: ExecutionRepository, S: SkillRepository> ExecutionEngine<E, S> {
    pub fn new(
        repo: E,
        registry: Arc<SkillRegistry<S>>,
        tools: Arc<dyn ToolInvoker>,
        rollback: Arc<RollbackManager>,
        event_bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        let checkpoint = Arc::new(CheckpointManager::new(repo));
        Self {
            runner: StepRunner::new(Arc::clone(&checkpoint), tools),
            checkpoint,
            registry,
            rollback,
            event_bus,
            config,
            workers: DashMap::new(),
            cancel_reasons: DashMap::new(),
        }
    }

    /// Handle `action` and `ai_decision` steps with `resolver`.
    pub fn with_resolver(mut self, resolver: Arc<dyn StepResolver>) -> Self {
        self.runner.set_resolver(resolver);
        self
    }

    pub fn registry(&self) -> &Arc<SkillRegistry<S>> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Whether a worker is currently advancing the execution.
    pub fn is_active(&self, id: Uuid) -> bool {
        self.workers.contains_key(&id)
    }

    // -----------------------------------------------------------------------
    // Control operations
    // -----------------------------------------------------------------------

    /// Create an execution of a skill and drive it until it stops.
    pub async fn start_execution(
        &self,
        request: StartRequest,
        env: &ExecutionEnv,
    ) -> Result<Execution, EngineError> {
        let skill = self.registry.resolve(&request.skill).await?;
        let state = skill.skill().state;
        if state == SkillState::Draft {
            return Err(EngineError::SkillNotExecutable {
                name: skill.technical_name().to_string(),
                state,
            });
        }

        let parameters = prepare_parameters(skill.skill(), request.input_data)?;
        let mut execution = Execution::new(skill.skill().id, skill.technical_name());
        execution.user_id = env.user_id.clone();
        execution.session_id = env.session_id.clone();
        execution.trigger_text = request.trigger_text;
        execution.current_context = parameters;
        self.checkpoint.create(&execution).await?;

        let token = CancellationToken::new();
        let _guard = self.claim(execution.id, token.clone())?;
        let mut run = Run {
            skill,
            ctx: ContextStore::from_map(execution.current_context.clone()),
            execution,
            token,
        };
        self.begin(&mut run, env).await?;
        Ok(run.execution)
    }

    /// Answer the prompt a `waiting_input` execution is suspended on and
    /// drive it again.
    pub async fn provide_input(
        &self,
        id: Uuid,
        value: Value,
        env: &ExecutionEnv,
    ) -> Result<Execution, EngineError> {
        self.feed_input(id, value, env, CancellationToken::new()).await
    }

    /// Continue an execution from its persisted cursor, e.g. after a worker
    /// crash. A `waiting_input` execution is returned unchanged.
    pub async fn resume(&self, id: Uuid, env: &ExecutionEnv) -> Result<Execution, EngineError> {
        let execution = self.load(id).await?;
        match execution.state {
            ExecutionState::WaitingInput => return Ok(execution),
            ExecutionState::Pending | ExecutionState::Running => {}
            from => {
                return Err(TransitionError {
                    from,
                    action: "resume",
                }
                .into());
            }
        }

        let token = CancellationToken::new();
        let _guard = self.claim(id, token.clone())?;
        let mut run = self.open_run(execution, token).await?;
        if run.execution.state == ExecutionState::Pending {
            self.begin(&mut run, env).await?;
        } else {
            tracing::info!(execution_id = %id, step = run.execution.current_step, "resuming execution");
            self.drive(&mut run, env).await?;
        }
        Ok(run.execution)
    }

    /// Mark an execution completed from outside the drive loop.
    pub async fn complete(
        &self,
        id: Uuid,
        output: Option<Value>,
        summary: Option<String>,
    ) -> Result<Execution, EngineError> {
        let mut execution = self.load(id).await?;
        let _guard = self.claim(id, CancellationToken::new())?;
        lifecycle::complete(&mut execution, output, summary)?;
        self.checkpoint.persist(&mut execution).await?;
        self.report_completed(&execution).await;
        Ok(execution)
    }

    /// Mark an execution failed from outside the drive loop.
    pub async fn fail(
        &self,
        id: Uuid,
        message: impl Into<String>,
        step_id: Option<String>,
    ) -> Result<Execution, EngineError> {
        let mut execution = self.load(id).await?;
        let _guard = self.claim(id, CancellationToken::new())?;
        lifecycle::fail(&mut execution, message, step_id)?;
        self.checkpoint.persist(&mut execution).await?;
        self.report_failed(&execution).await;
        Ok(execution)
    }

    /// Cancel an execution that has not produced a result.
    ///
    /// When a worker is advancing it, its token is tripped and the worker
    /// cancels before the next dispatch; the returned record is the one
    /// before cancellation took effect.
    pub async fn cancel(&self, id: Uuid, reason: Option<String>) -> Result<Execution, EngineError> {
        self.cancel_boxed(id, reason).await
    }

    /// Roll a completed or failed execution back to its rollback point.
    pub async fn rollback(&self, id: Uuid) -> Result<Execution, EngineError> {
        let mut execution = self.load(id).await?;
        match execution.state {
            ExecutionState::Completed | ExecutionState::Failed => {}
            ExecutionState::RolledBack => {
                let token = execution.rollback_token().unwrap_or_default().to_string();
                return Err(RollbackError::AlreadyConsumed(token).into());
            }
            from => {
                return Err(TransitionError {
                    from,
                    action: "roll back",
                }
                .into());
            }
        }
        if execution.rollback_token().is_none() {
            return Err(RollbackError::NothingToRollBack.into());
        }

        let _guard = self.claim(id, CancellationToken::new())?;
        self.apply_rollback(&mut execution).await?;
        Ok(execution)
    }

    /// Give up the rollback point of a finished execution.
    ///
    /// The snapshot or savepoint is discarded and the record forgets its
    /// token, so the execution can no longer be rolled back.
    pub async fn release(&self, id: Uuid) -> Result<Execution, EngineError> {
        let mut execution = self.load(id).await?;
        match execution.state {
            ExecutionState::Completed | ExecutionState::Failed => {}
            from => {
                return Err(TransitionError {
                    from,
                    action: "release",
                }
                .into());
            }
        }
        let Some(token) = execution.rollback_token().map(str::to_string) else {
            return Err(RollbackError::NothingToRollBack.into());
        };

        let _guard = self.claim(id, CancellationToken::new())?;
        match self.rollback.release(&token).await {
            Ok(()) => {}
            // Savepoints of an earlier process ended with its transaction
            Err(RollbackError::UnknownToken(_))
                if RollbackManager::detect_mode(&token) == Some(RollbackMode::Savepoint) => {}
            Err(e) => return Err(e.into()),
        }
        forget_rollback_point(&mut execution);
        self.checkpoint.persist(&mut execution).await?;
        tracing::info!(execution_id = %id, token = %token, "rollback point released");
        Ok(execution)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Execution, EngineError> {
        self.load(id).await
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, EngineError> {
        Ok(self.checkpoint.list(filter).await?)
    }

    pub async fn operations(
        &self,
        id: Uuid,
    ) -> Result<Vec<skillforge_types::execution::OperationLogEntry>, EngineError> {
        Ok(self.checkpoint.operations(id).await?)
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// pending -> running, open the rollback point, then drive.
    async fn begin(&self, run: &mut Run, env: &ExecutionEnv) -> Result<(), EngineError> {
        lifecycle::start(&mut run.execution)?;

        if run.execution.depth == 0 && run.skill.skill().wants_rollback_point() {
            match self.rollback.create(run.skill.technical_name(), env).await {
                Ok(token) => {
                    let mode = RollbackManager::detect_mode(&token);
                    match mode {
                        Some(RollbackMode::Snapshot) => run.execution.snapshot_token = Some(token),
                        Some(RollbackMode::Savepoint) | None => {
                            run.execution.savepoint_token = Some(token)
                        }
                    }
                    run.execution.rollback_mode = mode;
                }
                Err(e) => {
                    tracing::warn!(
                        execution_id = %run.execution.id,
                        error = %e,
                        "no rollback point for execution"
                    );
                }
            }
        }

        self.checkpoint.save(&mut run.execution, &run.ctx).await?;
        tracing::info!(
            execution_id = %run.execution.id,
            skill = %run.execution.skill_name,
            depth = run.execution.depth,
            rollback_mode = ?run.execution.rollback_mode,
            "execution started"
        );
        self.event_bus.publish(SkillEvent::ExecutionStarted {
            execution_id: run.execution.id,
            skill_name: run.execution.skill_name.clone(),
            parent_id: run.execution.parent_execution_id,
        });

        self.drive(run, env).await
    }

    /// Dispatch steps until the execution stops.
    async fn drive(&self, run: &mut Run, env: &ExecutionEnv) -> Result<(), EngineError> {
        let skill = Arc::clone(&run.skill);
        let limit_secs = skill
            .skill()
            .limits
            .timeout_secs
            .unwrap_or(self.config.default_timeout_secs);
        let budget = Duration::from_secs(limit_secs);
        let mut dispatched = 0usize;

        loop {
            if run.token.is_cancelled() {
                return self.finish_cancelled(run).await;
            }

            let Some(remaining) = remaining_budget(&run.execution, budget) else {
                let message = EngineError::Timeout { limit_secs }.to_string();
                return self.finish_failed(run, message, None, false).await;
            };

            if dispatched >= self.config.max_dispatch_steps {
                let message = format!(
                    "dispatch limit of {} steps reached (runaway jump?)",
                    self.config.max_dispatch_steps
                );
                return self.finish_failed(run, message, None, false).await;
            }

            let step_id = match next_step(&skill, run) {
                Ok(Some(step_id)) => step_id,
                Ok(None) => return self.finish_completed(run).await,
                Err(e) => return self.finish_failed(run, e.to_string(), None, false).await,
            };
            let (Some(step), Some(program)) = (skill.step(&step_id), skill.program(&step_id))
            else {
                let message = format!("cursor points at unknown step '{step_id}'");
                return self.finish_failed(run, message, None, false).await;
            };
            dispatched += 1;

            tracing::debug!(
                execution_id = %run.execution.id,
                step_id = %step.id,
                step_type = %step.step_type(),
                "dispatching step"
            );
            self.event_bus.publish(SkillEvent::StepStarted {
                execution_id: run.execution.id,
                step_id: step.id.clone(),
                step_type: step.step_type(),
            });

            let started = Instant::now();
            let result = if matches!(step.kind, StepKind::Subskill { .. }) {
                self.run_subskill(step, program, run, env).await
            } else {
                let mut scope = StepScope {
                    execution: &mut run.execution,
                    ctx: &mut run.ctx,
                    env,
                    deadline: Some(tokio::time::Instant::now() + remaining),
                    max_operations: skill.skill().limits.max_operations,
                    max_loop_iterations: self.config.max_loop_iterations,
                };
                self.runner.run(step, program, &mut scope).await
            };

            match self.apply(run, step, result, started).await? {
                Flow::Continue => {}
                Flow::Stop => return Ok(()),
            }
        }
    }

    /// Move the cursor according to a step's result and checkpoint.
    async fn apply(
        &self,
        run: &mut Run,
        step: &StepDefinition,
        result: Result<StepOutcome, StepError>,
        started: Instant,
    ) -> Result<Flow, EngineError> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => return self.step_failed(run, step, err).await,
        };

        match outcome {
            StepOutcome::Suspend(pending) => {
                let prompt = pending.prompt.clone();
                lifecycle::suspend(&mut run.execution, pending)?;
                self.checkpoint.save(&mut run.execution, &run.ctx).await?;
                tracing::info!(
                    execution_id = %run.execution.id,
                    step_id = %step.id,
                    "execution waiting for input"
                );
                self.event_bus.publish(SkillEvent::InputRequested {
                    execution_id: run.execution.id,
                    step_id: step.id.clone(),
                    prompt,
                });
                return Ok(Flow::Stop);
            }
            StepOutcome::EnterLoop(frame) => {
                let StepKind::Loop { item_variable, .. } = &step.kind else {
                    return Err(EngineError::InvalidInput(format!(
                        "step '{}' is not a loop",
                        step.id
                    )));
                };
                match frame.items.first() {
                    Some(first) => {
                        run.ctx.set(item_variable.clone(), first.clone())?;
                        run.execution.loop_stack.push(frame);
                    }
                    None => advance(&mut run.execution, 1),
                }
            }
            StepOutcome::Continue => advance(&mut run.execution, 1),
            StepOutcome::SkipNext => advance(&mut run.execution, 2),
            StepOutcome::Jump(target) => {
                if !jump(&run.skill, &mut run.execution, &target) {
                    let err = StepError::new(
                        step,
                        StepErrorKind::Internal,
                        format!("jump target '{target}' is not in scope"),
                    );
                    return self.step_failed(run, step, err).await;
                }
            }
        }

        run.execution.steps_completed += 1;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.event_bus.publish(SkillEvent::StepCompleted {
            execution_id: run.execution.id,
            step_id: step.id.clone(),
            duration_ms,
        });
        self.checkpoint.save(&mut run.execution, &run.ctx).await?;
        Ok(Flow::Continue)
    }

    /// Apply the critical / non-critical rule to a failed step.
    async fn step_failed(
        &self,
        run: &mut Run,
        step: &StepDefinition,
        err: StepError,
    ) -> Result<Flow, EngineError> {
        let fatal = err.is_fatal();
        self.event_bus.publish(SkillEvent::StepFailed {
            execution_id: run.execution.id,
            step_id: err.step_id.clone(),
            error: err.message.clone(),
            critical: fatal,
        });

        if run.token.is_cancelled() {
            self.finish_cancelled(run).await?;
            return Ok(Flow::Stop);
        }

        if fatal {
            let rollback = !err.is_timeout()
                && (step.rollback_on_failure || run.skill.skill().rollback_on_failure);
            let step_id = Some(err.step_id.clone());
            self.finish_failed(run, err.to_string(), step_id, rollback)
                .await?;
            return Ok(Flow::Stop);
        }

        tracing::warn!(
            execution_id = %run.execution.id,
            step_id = %err.step_id,
            error = %err.message,
            "non-critical step failed, continuing"
        );
        run.execution.step_errors.push(StepFailure {
            step_id: err.step_id,
            message: err.message,
            at: Utc::now(),
        });
        advance(&mut run.execution, 1);
        self.checkpoint.save(&mut run.execution, &run.ctx).await?;
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn finish_completed(&self, run: &mut Run) -> Result<(), EngineError> {
        let output = Value::Object(
            run.ctx
                .as_map()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let summary = format!("completed {} steps", run.execution.steps_completed);
        lifecycle::complete(&mut run.execution, Some(output), Some(summary))?;
        if self.config.release_on_complete {
            self.release_rollback_point(&run.execution).await;
            forget_rollback_point(&mut run.execution);
        }
        self.checkpoint.save(&mut run.execution, &run.ctx).await?;
        self.report_completed(&run.execution).await;
        Ok(())
    }

    async fn finish_failed(
        &self,
        run: &mut Run,
        message: String,
        step_id: Option<String>,
        rollback: bool,
    ) -> Result<(), EngineError> {
        lifecycle::fail(&mut run.execution, message, step_id)?;
        self.checkpoint.save(&mut run.execution, &run.ctx).await?;
        self.report_failed(&run.execution).await;

        if rollback && run.execution.rollback_token().is_some() {
            if let Err(e) = self.apply_rollback(&mut run.execution).await {
                tracing::warn!(
                    execution_id = %run.execution.id,
                    error = %e,
                    "automatic rollback failed"
                );
            }
        }
        Ok(())
    }

    async fn finish_cancelled(&self, run: &mut Run) -> Result<(), EngineError> {
        let reason = self
            .cancel_reasons
            .remove(&run.execution.id)
            .and_then(|(_, reason)| reason)
            .or_else(|| {
                run.execution
                    .parent_execution_id
                    .map(|parent| format!("parent execution {parent} cancelled"))
            });
        lifecycle::cancel(&mut run.execution, reason.clone())?;
        self.checkpoint.save(&mut run.execution, &run.ctx).await?;
        tracing::info!(execution_id = %run.execution.id, ?reason, "execution cancelled");
        self.event_bus.publish(SkillEvent::ExecutionCancelled {
            execution_id: run.execution.id,
            reason,
        });
        self.release_rollback_point(&run.execution).await;
        Ok(())
    }

    async fn report_completed(&self, execution: &Execution) {
        let duration_ms = execution.duration_ms();
        tracing::info!(
            execution_id = %execution.id,
            skill = %execution.skill_name,
            steps = execution.steps_completed,
            duration_ms,
            "execution completed"
        );
        self.event_bus.publish(SkillEvent::ExecutionCompleted {
            execution_id: execution.id,
            skill_name: execution.skill_name.clone(),
            steps_completed: execution.steps_completed,
            duration_ms,
        });
        self.record_outcome(execution, true, duration_ms).await;
    }

    async fn report_failed(&self, execution: &Execution) {
        let error = execution.error_message.clone().unwrap_or_default();
        tracing::info!(
            execution_id = %execution.id,
            skill = %execution.skill_name,
            step_id = ?execution.error_step_id,
            error = %error,
            "execution failed"
        );
        self.event_bus.publish(SkillEvent::ExecutionFailed {
            execution_id: execution.id,
            skill_name: execution.skill_name.clone(),
            error,
            step_id: execution.error_step_id.clone(),
        });
        self.record_outcome(execution, false, execution.duration_ms())
            .await;
    }

    async fn record_outcome(&self, execution: &Execution, success: bool, duration_ms: u64) {
        if let Err(e) = self
            .registry
            .record_outcome(&execution.skill_name, success, duration_ms)
            .await
        {
            tracing::warn!(skill = %execution.skill_name, error = %e, "failed to record skill statistics");
        }
    }

    /// Roll back through the execution's token and mark it `rolled_back`.
    async fn apply_rollback(&self, execution: &mut Execution) -> Result<(), EngineError> {
        let token = execution
            .rollback_token()
            .map(str::to_string)
            .ok_or(RollbackError::NothingToRollBack)?;

        let mode = match self.rollback.rollback(&token).await {
            Ok(mode) => mode,
            // The ledger forgets savepoints with their transaction
            Err(RollbackError::UnknownToken(t))
                if RollbackManager::detect_mode(&t) == Some(RollbackMode::Savepoint) =>
            {
                return Err(RollbackError::TransactionClosed(t).into());
            }
            Err(e) => return Err(e.into()),
        };

        lifecycle::roll_back(execution)?;
        execution.rollback_mode = Some(mode);
        self.checkpoint.persist(execution).await?;
        tracing::info!(execution_id = %execution.id, %mode, "execution rolled back");
        self.event_bus.publish(SkillEvent::ExecutionRolledBack {
            execution_id: execution.id,
            mode,
        });
        Ok(())
    }

    async fn release_rollback_point(&self, execution: &Execution) {
        let Some(token) = execution.rollback_token() else {
            return;
        };
        if let Err(e) = self.rollback.release(token).await {
            tracing::debug!(execution_id = %execution.id, error = %e, "rollback point not released");
        }
    }

    // -----------------------------------------------------------------------
    // Subskills
    // -----------------------------------------------------------------------

    /// Run (or continue) the child execution of a subskill step.
    async fn run_subskill(
        &self,
        step: &StepDefinition,
        program: &StepProgram,
        run: &mut Run,
        env: &ExecutionEnv,
    ) -> Result<StepOutcome, StepError> {
        let StepKind::Subskill { skill: reference, .. } = &step.kind else {
            return Err(StepError::internal(step, "not a subskill step"));
        };
        let subskill_err = |message: String| StepError::new(step, StepErrorKind::Subskill, message);

        let child = match run.execution.active_child {
            Some(child_id) => self
                .checkpoint
                .load(child_id)
                .await
                .map_err(|e| StepError::internal(step, e.to_string()))?,
            None => {
                let depth = run.execution.depth + 1;
                if depth > self.config.max_subskill_depth {
                    return Err(subskill_err(format!(
                        "subskill nesting limit of {} reached",
                        self.config.max_subskill_depth
                    )));
                }
                let compiled = self
                    .registry
                    .resolve(reference)
                    .await
                    .map_err(|e| subskill_err(e.to_string()))?;
                if compiled.skill().state == SkillState::Draft {
                    return Err(subskill_err(format!(
                        "subskill '{reference}' is a draft and cannot be executed"
                    )));
                }

                let mut child = Execution::new(compiled.skill().id, compiled.technical_name());
                child.parent_execution_id = Some(run.execution.id);
                child.depth = depth;
                child.user_id = run.execution.user_id.clone();
                child.session_id = run.execution.session_id.clone();
                child.current_context = child_context(step, program, &run.ctx)?;

                self.checkpoint
                    .create(&child)
                    .await
                    .map_err(|e| StepError::internal(step, e.to_string()))?;
                run.execution.active_child = Some(child.id);
                self.checkpoint
                    .save(&mut run.execution, &run.ctx)
                    .await
                    .map_err(|e| StepError::internal(step, e.to_string()))?;
                tracing::debug!(
                    execution_id = %run.execution.id,
                    child_id = %child.id,
                    skill = %child.skill_name,
                    "created subskill execution"
                );
                child
            }
        };

        let child = match child.state {
            ExecutionState::Pending | ExecutionState::Running => self
                .run_child(child, env, run.token.child_token())
                .await
                .map_err(|e| subskill_err(e.to_string()))?,
            _ => child,
        };
        self.subskill_outcome(step, program, run, child)
    }

    /// Drive a child execution. Boxed because it recurses through `drive`.
    fn run_child<'a>(
        &'a self,
        child: Execution,
        env: &'a ExecutionEnv,
        token: CancellationToken,
    ) -> BoxFuture<'a, Result<Execution, EngineError>> {
        Box::pin(async move {
            let _guard = self.claim(child.id, token.clone())?;
            let mut run = self.open_run(child, token).await?;
            if run.execution.state == ExecutionState::Pending {
                self.begin(&mut run, env).await?;
            } else {
                self.drive(&mut run, env).await?;
            }
            Ok(run.execution)
        })
    }

    /// Translate a child's state into the parent step's outcome.
    fn subskill_outcome(
        &self,
        step: &StepDefinition,
        program: &StepProgram,
        run: &mut Run,
        child: Execution,
    ) -> Result<StepOutcome, StepError> {
        let StepKind::Subskill { output_mapping, .. } = &step.kind else {
            return Err(StepError::internal(step, "not a subskill step"));
        };

        match child.state {
            ExecutionState::Completed => {
                let mut mapping: Vec<(&String, &String)> = output_mapping.iter().collect();
                mapping.sort();
                for (parent_key, child_key) in mapping {
                    if let Some(value) = child.current_context.get(child_key) {
                        run.ctx.set(parent_key.clone(), value.clone()).map_err(|e| {
                            StepError::new(step, StepErrorKind::Context, e.to_string())
                        })?;
                    }
                }
                bind_output(
                    step,
                    program,
                    child.result_output.unwrap_or(Value::Null),
                    &mut run.ctx,
                )?;
                run.execution.active_child = None;
                Ok(StepOutcome::Continue)
            }
            ExecutionState::WaitingInput => {
                let mut pending = child.pending_input.ok_or_else(|| {
                    StepError::internal(step, "child is waiting without a prompt")
                })?;
                pending.step_id = step.id.clone();
                pending.child_execution_id = Some(child.id);
                Ok(StepOutcome::Suspend(pending))
            }
            state => {
                run.execution.active_child = None;
                Err(StepError::new(
                    step,
                    StepErrorKind::Subskill,
                    format!(
                        "subskill '{}' ended {state}: {}",
                        child.skill_name,
                        child.error_message.unwrap_or_default()
                    ),
                ))
            }
        }
    }

    /// `provide_input` for one execution. Boxed because a prompt owned by a
    /// child is forwarded recursively.
    fn feed_input<'a>(
        &'a self,
        id: Uuid,
        value: Value,
        env: &'a ExecutionEnv,
        token: CancellationToken,
    ) -> BoxFuture<'a, Result<Execution, EngineError>> {
        Box::pin(async move {
            let execution = self.load(id).await?;
            if execution.state != ExecutionState::WaitingInput {
                return Err(TransitionError {
                    from: execution.state,
                    action: "provide input to",
                }
                .into());
            }
            let pending = execution
                .pending_input
                .clone()
                .ok_or_else(|| EngineError::InvalidInput("execution has no pending prompt".to_string()))?;

            let _guard = self.claim(id, token.clone())?;
            let mut run = self.open_run(execution, token).await?;

            match pending.child_execution_id {
                Some(child_id) => {
                    let child = self
                        .feed_input(child_id, value, env, run.token.child_token())
                        .await?;
                    lifecycle::resume(&mut run.execution, false)?;

                    let skill = Arc::clone(&run.skill);
                    let (Some(step), Some(program)) =
                        (skill.step(&pending.step_id), skill.program(&pending.step_id))
                    else {
                        let message = format!("pending step '{}' no longer exists", pending.step_id);
                        self.finish_failed(&mut run, message, Some(pending.step_id), false)
                            .await?;
                        return Ok(run.execution);
                    };
                    let started = Instant::now();
                    let outcome = self.subskill_outcome(step, program, &mut run, child);
                    if let Flow::Continue = self.apply(&mut run, step, outcome, started).await? {
                        self.drive(&mut run, env).await?;
                    }
                }
                None => {
                    let value = coerce_input(&pending, value)?;
                    run.ctx.set(pending.variable.clone(), value)?;
                    lifecycle::resume(&mut run.execution, true)?;
                    self.checkpoint.save(&mut run.execution, &run.ctx).await?;
                    tracing::info!(
                        execution_id = %id,
                        step_id = %pending.step_id,
                        variable = %pending.variable,
                        "input received"
                    );
                    self.drive(&mut run, env).await?;
                }
            }
            Ok(run.execution)
        })
    }

    /// Boxed because cancellation cascades into the active child.
    fn cancel_boxed<'a>(
        &'a self,
        id: Uuid,
        reason: Option<String>,
    ) -> BoxFuture<'a, Result<Execution, EngineError>> {
        Box::pin(async move {
            let mut execution = self.load(id).await?;
            if !matches!(
                execution.state,
                ExecutionState::Pending | ExecutionState::Running | ExecutionState::WaitingInput
            ) {
                return Err(TransitionError {
                    from: execution.state,
                    action: "cancel",
                }
                .into());
            }

            let active = self.workers.get(&id).map(|entry| entry.value().clone());
            if let Some(token) = active {
                self.cancel_reasons.insert(id, reason);
                token.cancel();
                tracing::info!(execution_id = %id, "cancellation requested");
                return Ok(execution);
            }

            let _guard = self.claim(id, CancellationToken::new())?;
            if let Some(child_id) = execution.active_child {
                match self.cancel_boxed(child_id, reason.clone()).await {
                    Ok(_) | Err(EngineError::Transition(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            lifecycle::cancel(&mut execution, reason.clone())?;
            self.checkpoint.persist(&mut execution).await?;
            tracing::info!(execution_id = %id, ?reason, "execution cancelled");
            self.event_bus.publish(SkillEvent::ExecutionCancelled {
                execution_id: id,
                reason,
            });
            self.release_rollback_point(&execution).await;
            Ok(execution)
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load(&self, id: Uuid) -> Result<Execution, EngineError> {
        Ok(self.checkpoint.load(id).await?)
    }

    async fn open_run(
        &self,
        execution: Execution,
        token: CancellationToken,
    ) -> Result<Run, EngineError> {
        let skill = self.registry.get_by_id(&execution.skill_id).await?;
        Ok(Run {
            skill,
            ctx: ContextStore::from_map(execution.current_context.clone()),
            execution,
            token,
        })
    }

    fn claim(&self, id: Uuid, token: CancellationToken) -> Result<WorkerGuard<'_>, EngineError> {
        match self.workers.entry(id) {
            Entry::Occupied(_) => Err(EngineError::Busy(id)),
            Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(WorkerGuard {
                    workers: &self.workers,
                    cancel_reasons: &self.cancel_reasons,
                    id,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// The step at the cursor, unwinding finished loop iterations on the way.
/// `None` once the top level is exhausted.
fn next_step(skill: &CompiledSkill, run: &mut Run) -> Result<Option<String>, ContextError> {
    loop {
        let Some(frame) = run.execution.loop_stack.last_mut() else {
            return Ok(skill
                .top_level_step(run.execution.current_step)
                .map(|s| s.id.clone()));
        };

        if frame.index >= frame.items.len() {
            run.execution.loop_stack.pop();
            advance(&mut run.execution, 1);
            continue;
        }

        let body = skill.loop_body(&frame.step_id);
        if let Some(step_id) = body.get(frame.body_position) {
            return Ok(Some(step_id.clone()));
        }

        frame.index += 1;
        frame.body_position = 0;
        if let Some(item) = frame.items.get(frame.index) {
            if let Some(StepKind::Loop { item_variable, .. }) =
                skill.step(&frame.step_id).map(|s| &s.kind)
            {
                run.ctx.set(item_variable.clone(), item.clone())?;
            }
        }
    }
}

/// Move the innermost cursor forward.
fn advance(execution: &mut Execution, by: usize) {
    match execution.loop_stack.last_mut() {
        Some(frame) => frame.body_position += by,
        None => execution.current_step += by,
    }
}

/// Point the innermost cursor at `target`. False when it is not in scope.
fn jump(skill: &CompiledSkill, execution: &mut Execution, target: &str) -> bool {
    match execution.loop_stack.last_mut() {
        Some(frame) => match skill
            .loop_body(&frame.step_id)
            .iter()
            .position(|id| id == target)
        {
            Some(position) => {
                frame.body_position = position;
                true
            }
            None => false,
        },
        None => match skill.top_level_position(target) {
            Some(position) => {
                execution.current_step = position;
                true
            }
            None => false,
        },
    }
}

/// Time left in the execution's budget, measured from `started_at`.
fn remaining_budget(execution: &Execution, budget: Duration) -> Option<Duration> {
    let Some(started) = execution.started_at else {
        return Some(budget);
    };
    let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
    budget.checked_sub(elapsed).filter(|r| !r.is_zero())
}

// ---------------------------------------------------------------------------
// Parameters and input
// ---------------------------------------------------------------------------

/// Check required keys and coerce string values to their declared types.
fn prepare_parameters(
    skill: &Skill,
    input: HashMap<String, Value>,
) -> Result<HashMap<String, Value>, EngineError> {
    for key in &skill.context_schema.required {
        if input.get(key).is_none_or(Value::is_null) {
            return Err(EngineError::MissingParameter(key.clone()));
        }
    }

    Ok(input
        .into_iter()
        .map(|(key, value)| {
            let value = match (&value, skill.context_schema.property(&key)) {
                (Value::String(text), Some(property)) => coerce(text, property.property_type),
                _ => value,
            };
            (key, value)
        })
        .collect())
}

/// Child context of a subskill step: a full copy of the parent context, or
/// only the mapped keys when a mapping is declared.
fn child_context(
    step: &StepDefinition,
    program: &StepProgram,
    parent: &ContextStore,
) -> Result<HashMap<String, Value>, StepError> {
    if program.context_mapping.is_empty() {
        return Ok(parent.as_map().clone());
    }
    program
        .context_mapping
        .iter()
        .map(|(key, expression)| {
            expression
                .evaluate(parent)
                .map(|value| (key.clone(), value))
                .map_err(|e| {
                    StepError::new(
                        step,
                        StepErrorKind::Subskill,
                        format!("context_mapping for '{key}' failed: {e}"),
                    )
                })
        })
        .collect()
}

fn forget_rollback_point(execution: &mut Execution) {
    execution.snapshot_token = None;
    execution.savepoint_token = None;
}

/// Convert a provided value to the pending prompt's input type.
fn coerce_input(pending: &PendingInput, value: Value) -> Result<Value, EngineError> {
    let invalid = |detail: String| EngineError::InvalidInput(format!("{}: {detail}", pending.variable));

    match pending.input_type {
        InputType::Text => Ok(match value {
            Value::String(_) => value,
            other => Value::String(display_value(&other)),
        }),
        InputType::Number => match &value {
            Value::Number(_) => Ok(value),
            Value::String(text) => {
                let text = text.trim();
                if let Ok(n) = text.parse::<i64>() {
                    Ok(Value::from(n))
                } else if let Some(n) = text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                    Ok(Value::Number(n))
                } else {
                    Err(invalid(format!("'{text}' is not a number")))
                }
            }
            other => Err(invalid(format!("{other} is not a number"))),
        },
        InputType::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(text) => match text.trim().to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                other => Err(invalid(format!("'{other}' is not a yes/no answer"))),
            },
            Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
                Ok(Value::Bool(n.as_i64() == Some(1)))
            }
            other => Err(invalid(format!("{other} is not a yes/no answer"))),
        },
        InputType::Selection => {
            let choice = display_value(&value);
            if pending.options.iter().any(|o| *o == choice) {
                Ok(Value::String(choice))
            } else {
                Err(invalid(format!(
                    "'{choice}' is not one of {:?}",
                    pending.options
                )))
            }
        }
        InputType::Date => {
            let text = display_value(&value);
            NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
                .map_err(|_| invalid(format!("'{text}' is not a YYYY-MM-DD date")))
        }
        InputType::Json => match value {
            Value::String(text) => serde_json::from_str(&text)
                .map_err(|e| invalid(format!("invalid JSON: {e}"))),
            other => Ok(other),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::definition::parse_skill_yaml;
    use crate::testing::{
        InMemoryExecutionRepository, InMemorySkillRepository, InMemorySnapshotService,
        ScriptedToolInvoker,
    };
    use serde_json::json;
    use skillforge_types::error::ToolErrorKind;

    type Engine = ExecutionEngine<InMemoryExecutionRepository, InMemorySkillRepository>;

    struct Harness {
        engine: Engine,
        tools: Arc<ScriptedToolInvoker>,
        snapshots: Arc<InMemorySnapshotService>,
        env: ExecutionEnv,
    }

    async fn harness(skills: &[&str]) -> Harness {
        harness_with(skills, EngineConfig::default()).await
    }

    async fn harness_with(skills: &[&str], config: EngineConfig) -> Harness {
        let bus = EventBus::default();
        let registry = Arc::new(SkillRegistry::new(InMemorySkillRepository::new(), bus.clone()));
        let parsed = skills
            .iter()
            .map(|yaml| {
                let mut skill = parse_skill_yaml(yaml).unwrap();
                skill.state = SkillState::Active;
                skill
            })
            .collect();
        registry.register_all(parsed).await.unwrap();

        let tools = Arc::new(ScriptedToolInvoker::new());
        let snapshots = Arc::new(InMemorySnapshotService::new());
        let rollback = Arc::new(RollbackManager::with_snapshots(snapshots.clone()));
        let engine = ExecutionEngine::new(
            InMemoryExecutionRepository::new(),
            registry,
            tools.clone(),
            rollback,
            bus,
            config,
        );
        Harness {
            engine,
            tools,
            snapshots,
            env: ExecutionEnv::for_user("alice"),
        }
    }

    const QUOTE: &str = r#"
technical_name: create_quote
name: Create Quote
context_schema:
  properties:
    - { name: partner, type: string }
    - { name: amount, type: number }
  required: [partner]
steps:
  - { id: create, name: Create, sequence: 10, type: tool_call, tool_name: sale.create_quote, params_template: '{"partner": {partner}}', output_variable: quote_id }
  - { id: notify, name: Notify, sequence: 20, type: tool_call, tool_name: mail.send, is_critical: false }
  - { id: check, name: Check, sequence: 30, type: validation, expression: quote_id != null }
"#;

    #[tokio::test]
    async fn test_non_critical_failure_advances() {
        let h = harness(&[QUOTE]).await;
        h.tools.respond("sale.create_quote", json!(7));
        h.tools.fail("mail.send", ToolErrorKind::Execution, "smtp down");

        let exec = h
            .engine
            .start_execution(
                StartRequest::new("create_quote").with_input("partner", json!("Acme")),
                &h.env,
            )
            .await
            .unwrap();

        assert_eq!(exec.state, ExecutionState::Completed);
        assert_eq!(exec.steps_completed, 2);
        assert_eq!(exec.step_errors.len(), 1);
        assert_eq!(exec.step_errors[0].step_id, "notify");
        assert_eq!(exec.current_context["quote_id"], json!(7));
        assert_eq!(exec.user_id.as_deref(), Some("alice"));

        let log = h.engine.operations(exec.id).await.unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_critical_failure_records_step() {
        let h = harness(&[QUOTE]).await;
        h.tools.fail("sale.create_quote", ToolErrorKind::PermissionDenied, "no access");

        let exec = h
            .engine
            .start_execution(
                StartRequest::new("create_quote").with_input("partner", json!("Acme")),
                &h.env,
            )
            .await
            .unwrap();

        assert_eq!(exec.state, ExecutionState::Failed);
        assert_eq!(exec.error_step_id.as_deref(), Some("create"));
        assert!(exec.error_message.unwrap().contains("no access"));
        assert!(h.tools.calls().iter().all(|(tool, _)| tool != "mail.send"));

        let stats = h.engine.registry().stats("create_quote").await.unwrap();
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn test_missing_parameter_and_coercion() {
        let h = harness(&[QUOTE]).await;
        let err = h
            .engine
            .start_execution(StartRequest::new("create_quote"), &h.env)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingParameter(ref key) if key == "partner"));

        h.tools.respond("sale.create_quote", json!(1));
        h.tools.respond("mail.send", json!(null));
        let exec = h
            .engine
            .start_execution(
                StartRequest::new("create_quote")
                    .with_input("partner", json!("Acme"))
                    .with_input("amount", json!("12.5")),
                &h.env,
            )
            .await
            .unwrap();
        assert_eq!(exec.current_context["amount"], json!(12.5));
    }

    #[tokio::test]
    async fn test_draft_skill_is_not_executable() {
        let h = harness(&[]).await;
        let mut draft = parse_skill_yaml(QUOTE).unwrap();
        draft.technical_name = "draft_quote".to_string();
        h.engine.registry().register(draft).await.unwrap();

        let err = h
            .engine
            .start_execution(
                StartRequest::new("draft_quote").with_input("partner", json!("Acme")),
                &h.env,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SkillNotExecutable { .. }));
    }

    const ORDER_LINES: &str = r#"
technical_name: order_lines
name: Order Lines
steps:
  - { id: each, name: Each, sequence: 10, type: loop, collection: lines, item_variable: line, body: [ask, add] }
  - { id: ask, name: Ask, type: user_input, prompt: "Quantity for {line}?", input_type: number, variable: qty }
  - { id: add, name: Add, type: tool_call, tool_name: sale.add_line, params_template: '{"line": {line}, "qty": {qty}}' }
  - { id: done, name: Done, sequence: 20, type: tool_call, tool_name: util.echo }
"#;

    #[tokio::test]
    async fn test_loop_suspends_and_resumes_at_same_position() {
        let h = harness(&[ORDER_LINES]).await;
        h.tools.respond("sale.add_line", json!(true));
        h.tools.respond("util.echo", json!({}));

        let exec = h
            .engine
            .start_execution(
                StartRequest::new("order_lines").with_input("lines", json!(["desk", "chair"])),
                &h.env,
            )
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::WaitingInput);
        assert_eq!(exec.pending_input.as_ref().unwrap().prompt, "Quantity for desk?");
        assert_eq!(exec.loop_stack.len(), 1);

        let exec = h.engine.provide_input(exec.id, json!("2"), &h.env).await.unwrap();
        assert_eq!(exec.state, ExecutionState::WaitingInput);
        assert_eq!(exec.pending_input.as_ref().unwrap().prompt, "Quantity for chair?");
        assert_eq!(exec.loop_stack[0].index, 1);

        let exec = h.engine.provide_input(exec.id, json!(5), &h.env).await.unwrap();
        assert_eq!(exec.state, ExecutionState::Completed);
        assert!(exec.loop_stack.is_empty());

        let added: Vec<Value> = h
            .tools
            .calls()
            .into_iter()
            .filter(|(tool, _)| tool == "sale.add_line")
            .map(|(_, params)| Value::Object(params))
            .collect();
        assert_eq!(
            added,
            vec![
                json!({ "line": "desk", "qty": 2 }),
                json!({ "line": "chair", "qty": 5 }),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_selection_keeps_waiting() {
        let h = harness(&[r#"
technical_name: pick
name: Pick
steps:
  - { id: ask, name: Ask, type: user_input, prompt: Which?, input_type: selection, options: [red, blue], variable: colour }
"#])
        .await;
        let exec = h
            .engine
            .start_execution(StartRequest::new("pick"), &h.env)
            .await
            .unwrap();

        let err = h
            .engine
            .provide_input(exec.id, json!("green"), &h.env)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        let stored = h.engine.get_execution(exec.id).await.unwrap();
        assert_eq!(stored.state, ExecutionState::WaitingInput);

        let exec = h.engine.provide_input(exec.id, json!("blue"), &h.env).await.unwrap();
        assert_eq!(exec.state, ExecutionState::Completed);
        assert_eq!(exec.current_context["colour"], json!("blue"));

        let err = h
            .engine
            .provide_input(exec.id, json!("red"), &h.env)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transition(_)));
    }

    const ADDRESS: &str = r#"
technical_name: ask_address
name: Ask Address
steps:
  - { id: street, name: Street, type: user_input, prompt: "Street for {partner}?", variable: street }
"#;

    const ONBOARD: &str = r#"
technical_name: onboard_partner
name: Onboard Partner
steps:
  - id: address
    name: Address
    sequence: 10
    type: subskill
    skill: ask_address
    context_mapping: { partner: "name|upper" }
    output_mapping: { partner_street: street }
  - { id: save, name: Save, sequence: 20, type: tool_call, tool_name: crm.save, params_template: '{"street": {partner_street}}' }
"#;

    #[tokio::test]
    async fn test_subskill_forwards_input_and_merges_output() {
        let h = harness(&[ADDRESS, ONBOARD]).await;
        h.tools.respond("crm.save", json!({ "id": 3 }));

        let parent = h
            .engine
            .start_execution(
                StartRequest::new("onboard_partner").with_input("name", json!("acme")),
                &h.env,
            )
            .await
            .unwrap();
        assert_eq!(parent.state, ExecutionState::WaitingInput);
        let pending = parent.pending_input.clone().unwrap();
        assert_eq!(pending.prompt, "Street for ACME?");
        assert_eq!(pending.step_id, "address");
        let child_id = pending.child_execution_id.unwrap();
        assert_eq!(parent.active_child, Some(child_id));

        let parent = h
            .engine
            .provide_input(parent.id, json!("Main St 1"), &h.env)
            .await
            .unwrap();
        assert_eq!(parent.state, ExecutionState::Completed);
        assert_eq!(parent.current_context["partner_street"], json!("Main St 1"));
        assert!(parent.active_child.is_none());

        let child = h.engine.get_execution(child_id).await.unwrap();
        assert_eq!(child.state, ExecutionState::Completed);
        assert_eq!(child.parent_execution_id, Some(parent.id));
        assert_eq!(child.depth, 1);
        assert!(child.current_context.get("name").is_none());
    }

    #[tokio::test]
    async fn test_subskill_depth_limit() {
        let config = EngineConfig {
            max_subskill_depth: 0,
            ..EngineConfig::default()
        };
        let h = harness_with(&[ADDRESS, ONBOARD], config).await;
        let exec = h
            .engine
            .start_execution(
                StartRequest::new("onboard_partner").with_input("name", json!("acme")),
                &h.env,
            )
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::Failed);
        assert!(exec.error_message.unwrap().contains("nesting limit"));
    }

    #[tokio::test]
    async fn test_cancel_waiting_execution_cascades_to_child() {
        let h = harness(&[ADDRESS, ONBOARD]).await;
        let parent = h
            .engine
            .start_execution(
                StartRequest::new("onboard_partner").with_input("name", json!("acme")),
                &h.env,
            )
            .await
            .unwrap();
        let child_id = parent.active_child.unwrap();

        let cancelled = h
            .engine
            .cancel(parent.id, Some("user left".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.state, ExecutionState::Cancelled);
        assert_eq!(cancelled.error_message.as_deref(), Some("cancelled: user left"));

        let child = h.engine.get_execution(child_id).await.unwrap();
        assert_eq!(child.state, ExecutionState::Cancelled);

        let err = h.engine.cancel(parent.id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Transition(_)));
    }

    const ROLLBACK: &str = r#"
technical_name: post_invoice
name: Post Invoice
rollback_on_failure: true
steps:
  - { id: post, name: Post, sequence: 10, type: tool_call, tool_name: acc.post }
  - { id: verify, name: Verify, sequence: 20, type: validation, expression: "posted == true", message: "invoice was not posted" }
"#;

    #[tokio::test]
    async fn test_critical_failure_rolls_back_automatically() {
        let h = harness(&[ROLLBACK]).await;
        h.tools.respond("acc.post", json!({ "ok": true }));

        let exec = h
            .engine
            .start_execution(StartRequest::new("post_invoice"), &h.env)
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::RolledBack);
        assert_eq!(exec.rollback_mode, Some(RollbackMode::Snapshot));
        assert_eq!(exec.error_step_id.as_deref(), Some("verify"));
        assert_eq!(exec.error_message.as_deref(), Some("step 'verify' failed: invoice was not posted"));
        assert_eq!(h.snapshots.restored().len(), 1);

        let err = h.engine.rollback(exec.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Rollback(RollbackError::AlreadyConsumed(_))));
    }

    #[tokio::test]
    async fn test_manual_rollback_is_single_use() {
        let h = harness(&[ROLLBACK]).await;
        h.tools.respond("acc.post", json!({ "ok": true }));

        let exec = h
            .engine
            .start_execution(
                StartRequest::new("post_invoice").with_input("posted", json!(true)),
                &h.env,
            )
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::Completed);
        assert!(exec.snapshot_token.as_deref().unwrap().starts_with("pitr_"));

        let rolled = h.engine.rollback(exec.id).await.unwrap();
        assert_eq!(rolled.state, ExecutionState::RolledBack);
        assert!(h.engine.rollback(exec.id).await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_without_token() {
        let h = harness(&[QUOTE]).await;
        h.tools.respond("sale.create_quote", json!(1));
        h.tools.respond("mail.send", json!(null));
        let exec = h
            .engine
            .start_execution(
                StartRequest::new("create_quote").with_input("partner", json!("Acme")),
                &h.env,
            )
            .await
            .unwrap();
        let err = h.engine.rollback(exec.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Rollback(RollbackError::NothingToRollBack)));
    }

    #[tokio::test]
    async fn test_release_drops_snapshot_of_completed_execution() {
        let h = harness(&[ROLLBACK]).await;
        h.tools.respond("acc.post", json!({ "ok": true }));
        let exec = h
            .engine
            .start_execution(
                StartRequest::new("post_invoice").with_input("posted", json!(true)),
                &h.env,
            )
            .await
            .unwrap();
        assert_eq!(h.snapshots.len(), 1);

        let released = h.engine.release(exec.id).await.unwrap();
        assert_eq!(released.state, ExecutionState::Completed);
        assert!(released.snapshot_token.is_none());
        assert!(!released.can_rollback());
        assert!(h.snapshots.is_empty());

        let stored = h.engine.get_execution(exec.id).await.unwrap();
        assert!(stored.rollback_token().is_none());
        assert!(matches!(
            h.engine.rollback(exec.id).await.unwrap_err(),
            EngineError::Rollback(RollbackError::NothingToRollBack)
        ));
        assert!(matches!(
            h.engine.release(exec.id).await.unwrap_err(),
            EngineError::Rollback(RollbackError::NothingToRollBack)
        ));
    }

    #[tokio::test]
    async fn test_release_rejects_rolled_back_execution() {
        let h = harness(&[ROLLBACK]).await;
        h.tools.respond("acc.post", json!({ "ok": true }));
        let exec = h
            .engine
            .start_execution(StartRequest::new("post_invoice"), &h.env)
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::RolledBack);

        let err = h.engine.release(exec.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Transition(_)));
    }

    #[tokio::test]
    async fn test_release_on_complete_keeps_no_snapshot() {
        let config = EngineConfig {
            release_on_complete: true,
            ..EngineConfig::default()
        };
        let h = harness_with(&[ROLLBACK], config).await;
        h.tools.respond("acc.post", json!({ "ok": true }));

        let done = h
            .engine
            .start_execution(
                StartRequest::new("post_invoice").with_input("posted", json!(true)),
                &h.env,
            )
            .await
            .unwrap();
        assert_eq!(done.state, ExecutionState::Completed);
        assert!(done.rollback_token().is_none());
        assert!(h.snapshots.is_empty());

        // Failures keep their point until rolled back
        let failed = h
            .engine
            .start_execution(StartRequest::new("post_invoice"), &h.env)
            .await
            .unwrap();
        assert_eq!(failed.state, ExecutionState::RolledBack);
        assert_eq!(h.snapshots.restored().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_execution_stops_before_next_step() {
        let h = harness(&[r#"
technical_name: sync_partners
name: Sync Partners
steps:
  - { id: fetch, name: Fetch, sequence: 10, type: tool_call, tool_name: crm.fetch, output_variable: partners }
  - { id: push, name: Push, sequence: 20, type: tool_call, tool_name: crm.push }
"#])
        .await;
        h.tools
            .respond_after("crm.fetch", json!(["acme"]), Duration::from_millis(300));
        h.tools.respond("crm.push", json!(null));

        let run = h
            .engine
            .start_execution(StartRequest::new("sync_partners"), &h.env);
        let stop = async {
            let id = loop {
                let running = h
                    .engine
                    .list_executions(&ExecutionFilter::default())
                    .await
                    .unwrap();
                match running.first() {
                    Some(exec) if h.engine.is_active(exec.id) => break exec.id,
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            };
            h.engine
                .cancel(id, Some("operator stop".to_string()))
                .await
                .unwrap();
            id
        };
        let (finished, id) = tokio::join!(run, stop);
        let finished = finished.unwrap();

        assert_eq!(finished.id, id);
        assert_eq!(finished.state, ExecutionState::Cancelled);
        assert_eq!(finished.error_message.as_deref(), Some("cancelled: operator stop"));

        let stored = h.engine.get_execution(id).await.unwrap();
        assert_eq!(stored.state, ExecutionState::Cancelled);
        assert_eq!(stored.steps_completed, 1);

        let operations = h.engine.operations(id).await.unwrap();
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].step_id, "fetch");

        let calls: Vec<String> = h.tools.calls().into_iter().map(|(tool, _)| tool).collect();
        assert_eq!(calls, vec!["crm.fetch"]);
        assert!(!h.engine.is_active(id));
    }

    #[tokio::test]
    async fn test_timeout_fails_without_rollback() {
        let h = harness(&[r#"
technical_name: slow
name: Slow
rollback_on_failure: true
limits: { timeout_secs: 1 }
steps:
  - { id: wait, name: Wait, type: tool_call, tool_name: ext.slow }
"#])
        .await;
        h.tools
            .respond_after("ext.slow", json!(null), Duration::from_millis(1500));

        let exec = h
            .engine
            .start_execution(StartRequest::new("slow"), &h.env)
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::Failed);
        assert_eq!(exec.error_step_id.as_deref(), Some("wait"));
        assert!(exec.snapshot_token.is_some());
        assert!(h.snapshots.restored().is_empty());
    }

    #[tokio::test]
    async fn test_operation_limit_fails_execution() {
        let h = harness(&[r#"
technical_name: chatty
name: Chatty
limits: { max_operations: 1 }
steps:
  - { id: a, name: A, sequence: 1, type: tool_call, tool_name: util.echo, is_critical: false }
  - { id: b, name: B, sequence: 2, type: tool_call, tool_name: util.echo, is_critical: false }
"#])
        .await;
        h.tools.respond("util.echo", json!({}));

        let exec = h
            .engine
            .start_execution(StartRequest::new("chatty"), &h.env)
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::Failed);
        assert_eq!(exec.error_step_id.as_deref(), Some("b"));
        assert_eq!(exec.operation_count, 1);
    }

    #[tokio::test]
    async fn test_runaway_jump_hits_dispatch_limit() {
        let config = EngineConfig {
            max_dispatch_steps: 20,
            ..EngineConfig::default()
        };
        let h = harness_with(
            &[r#"
technical_name: spin
name: Spin
steps:
  - { id: again, name: Again, type: condition, expression: "true", on_success_step: again }
"#],
            config,
        )
        .await;
        let exec = h
            .engine
            .start_execution(StartRequest::new("spin"), &h.env)
            .await
            .unwrap();
        assert_eq!(exec.state, ExecutionState::Failed);
        assert!(exec.error_message.unwrap().contains("dispatch limit"));
    }

    #[tokio::test]
    async fn test_resume_running_execution_from_checkpoint() {
        let h = harness(&[QUOTE]).await;
        h.tools.respond("mail.send", json!(null));
        let compiled = h.engine.registry().get("create_quote").await.unwrap();

        // A worker crashed after the first step
        let mut exec = Execution::new(compiled.skill().id, "create_quote");
        exec.state = ExecutionState::Running;
        exec.started_at = Some(Utc::now());
        exec.current_step = 1;
        exec.current_context.insert("quote_id".to_string(), json!(9));
        h.engine.checkpoint.create(&exec).await.unwrap();

        let exec = h.engine.resume(exec.id, &h.env).await.unwrap();
        assert_eq!(exec.state, ExecutionState::Completed);
        assert!(h.tools.calls().iter().all(|(tool, _)| tool != "sale.create_quote"));
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let h = harness(&[QUOTE]).await;
        let mut rx = h.engine.event_bus().subscribe();
        h.tools.respond("sale.create_quote", json!(7));
        h.tools.respond("mail.send", json!(null));

        h.engine
            .start_execution(
                StartRequest::new("create_quote").with_input("partner", json!("Acme")),
                &h.env,
            )
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("execution_started"));
        assert_eq!(kinds.last().map(String::as_str), Some("execution_completed"));
        assert_eq!(kinds.iter().filter(|k| *k == "step_completed").count(), 3);
    }

    #[test]
    fn test_coerce_input_types() {
        let pending = |input_type| PendingInput {
            prompt: String::new(),
            input_type,
            options: vec!["a".to_string()],
            variable: "v".to_string(),
            step_id: "s".to_string(),
            child_execution_id: None,
        };
        assert_eq!(coerce_input(&pending(InputType::Number), json!("42")).unwrap(), json!(42));
        assert_eq!(coerce_input(&pending(InputType::Boolean), json!("yes")).unwrap(), json!(true));
        assert_eq!(
            coerce_input(&pending(InputType::Date), json!("2026-03-01")).unwrap(),
            json!("2026-03-01")
        );
        assert!(coerce_input(&pending(InputType::Date), json!("03/01/2026")).is_err());
        assert_eq!(
            coerce_input(&pending(InputType::Json), json!("{\"k\": 1}")).unwrap(),
            json!({ "k": 1 })
        );
        assert_eq!(coerce_input(&pending(InputType::Text), json!(5)).unwrap(), json!("5"));
        assert!(coerce_input(&pending(InputType::Selection), json!("b")).is_err());
    }
}
