//! Event types for the skill engine event bus.
//!
//! `SkillEvent` is broadcast during execution lifecycle transitions. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::RollbackMode;
use crate::skill::StepType;

/// Events emitted by the execution engine and the skill registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkillEvent {
    /// A skill was registered or replaced.
    SkillRegistered { skill_name: String, version: String },

    /// An execution left `pending`.
    ExecutionStarted {
        execution_id: Uuid,
        skill_name: String,
        parent_id: Option<Uuid>,
    },

    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_type: StepType,
    },

    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    /// A step failed; `critical` tells whether the execution fails with it.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
        critical: bool,
    },

    /// The execution suspended on a user prompt.
    InputRequested {
        execution_id: Uuid,
        step_id: String,
        prompt: String,
    },

    ExecutionCompleted {
        execution_id: Uuid,
        skill_name: String,
        steps_completed: u32,
        duration_ms: u64,
    },

    ExecutionFailed {
        execution_id: Uuid,
        skill_name: String,
        error: String,
        step_id: Option<String>,
    },

    ExecutionCancelled {
        execution_id: Uuid,
        reason: Option<String>,
    },

    ExecutionRolledBack {
        execution_id: Uuid,
        mode: RollbackMode,
    },
}

impl SkillEvent {
    /// Execution the event belongs to, if any.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            SkillEvent::SkillRegistered { .. } => None,
            SkillEvent::ExecutionStarted { execution_id, .. }
            | SkillEvent::StepStarted { execution_id, .. }
            | SkillEvent::StepCompleted { execution_id, .. }
            | SkillEvent::StepFailed { execution_id, .. }
            | SkillEvent::InputRequested { execution_id, .. }
            | SkillEvent::ExecutionCompleted { execution_id, .. }
            | SkillEvent::ExecutionFailed { execution_id, .. }
            | SkillEvent::ExecutionCancelled { execution_id, .. }
            | SkillEvent::ExecutionRolledBack { execution_id, .. } => Some(*execution_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_tag() {
        let id = Uuid::now_v7();
        let event = SkillEvent::StepFailed {
            execution_id: id,
            step_id: "create".to_string(),
            error: "boom".to_string(),
            critical: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_failed");
        let parsed: SkillEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed, SkillEvent::StepFailed { critical: false, .. }));
        assert_eq!(parsed.execution_id(), Some(id));
    }

    #[test]
    fn test_registry_event_has_no_execution() {
        let event = SkillEvent::SkillRegistered {
            skill_name: "demo".to_string(),
            version: "1.0.0".to_string(),
        };
        assert_eq!(event.execution_id(), None);
    }
}
