//! Execution tracking types.
//!
//! An `Execution` is one run of a `Skill`. It carries everything needed to
//! resume the run after a suspension or a worker crash: the step cursor, the
//! loop cursor stack, the serialized context store and the pending input
//! prompt. `OperationLogEntry` rows audit every side-effecting call.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::skill::{InputType, SkillId};

/// Prefix of savepoint rollback tokens.
pub const SAVEPOINT_TOKEN_PREFIX: &str = "sp_";
/// Prefix of snapshot (point-in-time recovery) rollback tokens.
pub const SNAPSHOT_TOKEN_PREFIX: &str = "pitr_";

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution.
///
/// ```text
/// pending -> running <-> waiting_input
/// running -> completed | failed
/// running | waiting_input -> cancelled
/// completed | failed -> rolled_back
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Pending,
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::WaitingInput)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingInput => "waiting_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_input" => Ok(Self::WaitingInput),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(format!("invalid execution state: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Rollback mode
// ---------------------------------------------------------------------------

/// Compensation strategy behind a rollback token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMode {
    /// Transaction-scoped savepoint (`sp_` token).
    Savepoint,
    /// Restore point that survives commit (`pitr_` token).
    Snapshot,
}

impl RollbackMode {
    /// Classify a token purely by its prefix.
    pub fn of_token(token: &str) -> Option<Self> {
        if token.starts_with(SNAPSHOT_TOKEN_PREFIX) {
            Some(Self::Snapshot)
        } else if token.starts_with(SAVEPOINT_TOKEN_PREFIX) {
            Some(Self::Savepoint)
        } else {
            None
        }
    }
}

impl fmt::Display for RollbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Savepoint => write!(f, "savepoint"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

impl FromStr for RollbackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "savepoint" => Ok(Self::Savepoint),
            "snapshot" => Ok(Self::Snapshot),
            other => Err(format!("invalid rollback mode: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Suspension and loop cursors
// ---------------------------------------------------------------------------

/// The prompt an execution is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInput {
    pub prompt: String,
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Context key that receives the provided value.
    pub variable: String,
    /// Step that suspended.
    pub step_id: String,
    /// Set when the prompt belongs to a suspended child execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_execution_id: Option<Uuid>,
}

/// Position inside one active loop.
///
/// Frames are stacked outermost first. `items` is the evaluated collection,
/// frozen when the loop was entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopFrame {
    pub step_id: String,
    pub items: Vec<serde_json::Value>,
    /// Index of the current item.
    pub index: usize,
    /// Index of the next body step to run for the current item.
    pub body_position: usize,
}

/// A non-critical step failure that was recorded and skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub skill_id: SkillId,
    /// Technical name of the skill (denormalized for display).
    pub skill_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_text: Option<String>,
    pub state: ExecutionState,
    /// Index into the skill's top-level step order.
    pub current_step: usize,
    pub steps_completed: u32,
    /// Serialized context store.
    #[serde(default)]
    pub current_context: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_input: Option<PendingInput>,
    /// The step at the cursor already received its input.
    #[serde(default)]
    pub input_satisfied: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loop_stack: Vec<LoopFrame>,
    /// Nested execution currently driven by a subskill step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_child: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_mode: Option<RollbackMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_errors: Vec<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    /// Tool, action and decision invocations so far.
    pub operation_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    /// 0 for top-level executions.
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// A fresh `pending` execution.
    pub fn new(skill_id: SkillId, skill_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            skill_id,
            skill_name: skill_name.into(),
            user_id: None,
            session_id: None,
            trigger_text: None,
            state: ExecutionState::Pending,
            current_step: 0,
            steps_completed: 0,
            current_context: HashMap::new(),
            pending_input: None,
            input_satisfied: false,
            loop_stack: Vec::new(),
            active_child: None,
            snapshot_token: None,
            savepoint_token: None,
            rollback_mode: None,
            error_message: None,
            error_step_id: None,
            step_errors: Vec::new(),
            result_output: None,
            result_summary: None,
            operation_count: 0,
            parent_execution_id: None,
            depth: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// The rollback token held by this execution, whichever family it is.
    pub fn rollback_token(&self) -> Option<&str> {
        self.snapshot_token
            .as_deref()
            .or(self.savepoint_token.as_deref())
    }

    /// Only completed or failed executions holding a token may roll back.
    pub fn can_rollback(&self) -> bool {
        matches!(
            self.state,
            ExecutionState::Completed | ExecutionState::Failed
        ) && self.rollback_token().is_some()
    }

    /// Wall-clock duration from start to completion (or now).
    pub fn duration_ms(&self) -> u64 {
        let Some(started) = self.started_at else {
            return 0;
        };
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - started).num_milliseconds().max(0) as u64
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Operation log
// ---------------------------------------------------------------------------

/// Kind of side-effecting call recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ToolCall,
    Action,
    Decision,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolCall => write!(f, "tool_call"),
            Self::Action => write!(f, "action"),
            Self::Decision => write!(f, "decision"),
        }
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call" => Ok(Self::ToolCall),
            "action" => Ok(Self::Action),
            "decision" => Ok(Self::Decision),
            other => Err(format!("invalid operation type: '{other}'")),
        }
    }
}

/// Outcome of one logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Success,
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid operation state: '{other}'")),
        }
    }
}

/// Audit row for one tool, action or decision invocation (one per attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub tool_name: String,
    pub operation_type: OperationType,
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub state: OperationState,
    /// 1-based attempt number.
    pub attempt: u32,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionState::Pending.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(!ExecutionState::WaitingInput.is_terminal());
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::Cancelled.is_terminal());
        assert!(ExecutionState::RolledBack.is_terminal());
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            ExecutionState::Pending,
            ExecutionState::Running,
            ExecutionState::WaitingInput,
            ExecutionState::Completed,
            ExecutionState::Failed,
            ExecutionState::Cancelled,
            ExecutionState::RolledBack,
        ] {
            assert_eq!(state.to_string().parse::<ExecutionState>().unwrap(), state);
        }
    }

    #[test]
    fn test_rollback_mode_of_token() {
        assert_eq!(RollbackMode::of_token("pitr_abc"), Some(RollbackMode::Snapshot));
        assert_eq!(RollbackMode::of_token("sp_quote_1"), Some(RollbackMode::Savepoint));
        assert_eq!(RollbackMode::of_token("nope"), None);
    }

    #[test]
    fn test_can_rollback_requires_token_and_state() {
        let mut exec = Execution::new(SkillId::new(), "demo");
        exec.state = ExecutionState::Completed;
        assert!(!exec.can_rollback());

        exec.savepoint_token = Some("sp_demo_1".to_string());
        assert!(exec.can_rollback());

        exec.state = ExecutionState::Cancelled;
        assert!(!exec.can_rollback());
    }

    #[test]
    fn test_execution_serde_skips_empty_fields() {
        let mut exec = Execution::new(SkillId::new(), "demo");
        exec.current_context.insert("partner".to_string(), json!("Acme"));
        let value = serde_json::to_value(&exec).unwrap();
        assert_eq!(value["state"], "pending");
        assert_eq!(value["current_context"]["partner"], "Acme");
        assert!(value.get("pending_input").is_none());
        assert!(value.get("loop_stack").is_none());

        let parsed: Execution = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.id, exec.id);
        assert_eq!(parsed.skill_name, "demo");
    }
}
