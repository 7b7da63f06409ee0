//! Execution state machine.
//!
//! Pure transition functions over `Execution`. Each checks the source state,
//! applies the transition and stamps the relevant timestamps. Persistence
//! and event publication are the engine's job.

use chrono::Utc;
use serde_json::Value;
use skillforge_types::execution::{Execution, ExecutionState, PendingInput};

/// A transition was requested from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} an execution in state '{from}'")]
pub struct TransitionError {
    pub from: ExecutionState,
    pub action: &'static str,
}

fn require(
    execution: &Execution,
    action: &'static str,
    allowed: &[ExecutionState],
) -> Result<(), TransitionError> {
    if allowed.contains(&execution.state) {
        Ok(())
    } else {
        Err(TransitionError {
            from: execution.state,
            action,
        })
    }
}

/// pending -> running
pub fn start(execution: &mut Execution) -> Result<(), TransitionError> {
    require(execution, "start", &[ExecutionState::Pending])?;
    execution.state = ExecutionState::Running;
    execution.started_at = Some(Utc::now());
    Ok(())
}

/// running -> waiting_input
pub fn suspend(execution: &mut Execution, pending: PendingInput) -> Result<(), TransitionError> {
    require(execution, "suspend", &[ExecutionState::Running])?;
    execution.state = ExecutionState::WaitingInput;
    execution.pending_input = Some(pending);
    Ok(())
}

/// waiting_input -> running. `satisfied` marks the step at the cursor as
/// having received its input.
pub fn resume(execution: &mut Execution, satisfied: bool) -> Result<(), TransitionError> {
    require(execution, "provide input to", &[ExecutionState::WaitingInput])?;
    execution.state = ExecutionState::Running;
    execution.pending_input = None;
    execution.input_satisfied = satisfied;
    Ok(())
}

/// running | waiting_input -> completed
pub fn complete(
    execution: &mut Execution,
    output: Option<Value>,
    summary: Option<String>,
) -> Result<(), TransitionError> {
    require(
        execution,
        "complete",
        &[ExecutionState::Running, ExecutionState::WaitingInput],
    )?;
    execution.state = ExecutionState::Completed;
    execution.completed_at = Some(Utc::now());
    execution.pending_input = None;
    execution.result_output = output;
    execution.result_summary = summary;
    Ok(())
}

/// pending | running | waiting_input -> failed
pub fn fail(
    execution: &mut Execution,
    message: impl Into<String>,
    step_id: Option<String>,
) -> Result<(), TransitionError> {
    require(
        execution,
        "fail",
        &[
            ExecutionState::Pending,
            ExecutionState::Running,
            ExecutionState::WaitingInput,
        ],
    )?;
    execution.state = ExecutionState::Failed;
    execution.completed_at = Some(Utc::now());
    execution.pending_input = None;
    execution.error_message = Some(message.into());
    execution.error_step_id = step_id;
    Ok(())
}

/// pending | running | waiting_input -> cancelled
pub fn cancel(execution: &mut Execution, reason: Option<String>) -> Result<(), TransitionError> {
    require(
        execution,
        "cancel",
        &[
            ExecutionState::Pending,
            ExecutionState::Running,
            ExecutionState::WaitingInput,
        ],
    )?;
    execution.state = ExecutionState::Cancelled;
    execution.completed_at = Some(Utc::now());
    execution.pending_input = None;
    execution.error_message = reason.map(|r| format!("cancelled: {r}"));
    Ok(())
}

/// completed | failed -> rolled_back
pub fn roll_back(execution: &mut Execution) -> Result<(), TransitionError> {
    require(
        execution,
        "roll back",
        &[ExecutionState::Completed, ExecutionState::Failed],
    )?;
    execution.state = ExecutionState::RolledBack;
    Ok(())
}
