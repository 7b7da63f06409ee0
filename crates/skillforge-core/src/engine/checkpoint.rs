//! Durable checkpoint manager for execution state.
//!
//! Wraps `ExecutionRepository` to provide a higher-level API for recording
//! execution checkpoints. The full execution record (cursor, loop stack,
//! context, pending prompt) is persisted after every step so that a crashed
//! worker can resume from the last checkpoint.

use skillforge_types::execution::{Execution, OperationLogEntry};
use skillforge_types::error::RepositoryError;
use uuid::Uuid;

use crate::repository::execution::{ExecutionFilter, ExecutionRepository};

use super::context::ContextStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable checkpoints of executions.
///
/// Generic over `E: ExecutionRepository` so it works with any storage
/// backend (SQLite, in-memory, etc.).
pub struct CheckpointManager<E: ExecutionRepository> {
    repo: E,
}

impl<E: ExecutionRepository> CheckpointManager<E> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: E) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &E {
        &self.repo
    }

    /// Persist a newly created execution.
    pub async fn create(&self, execution: &Execution) -> Result<(), CheckpointError> {
        self.repo
            .create_execution(execution)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution.id,
            skill = %execution.skill_name,
            depth = execution.depth,
            "checkpointed execution create"
        );
        Ok(())
    }

    /// Copy the context store into the record and persist it.
    pub async fn save(
        &self,
        execution: &mut Execution,
        ctx: &ContextStore,
    ) -> Result<(), CheckpointError> {
        execution.current_context = ctx.as_map().clone();
        self.persist(execution).await
    }

    /// Persist the record as it is.
    pub async fn persist(&self, execution: &mut Execution) -> Result<(), CheckpointError> {
        execution.touch();
        self.repo
            .save_execution(execution)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => CheckpointError::ExecutionNotFound(execution.id),
                other => CheckpointError::Repository(other.to_string()),
            })?;

        tracing::debug!(
            execution_id = %execution.id,
            state = %execution.state,
            current_step = execution.current_step,
            loop_depth = execution.loop_stack.len(),
            "checkpointed execution"
        );
        Ok(())
    }

    /// Load an execution record.
    pub async fn load(&self, id: Uuid) -> Result<Execution, CheckpointError> {
        self.repo
            .get_execution(&id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::ExecutionNotFound(id))
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, CheckpointError> {
        self.repo
            .list_executions(filter)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Append one entry to the operation log.
    pub async fn log_operation(&self, entry: &OperationLogEntry) -> Result<(), CheckpointError> {
        self.repo
            .append_operation(entry)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %entry.execution_id,
            step_id = %entry.step_id,
            tool = %entry.tool_name,
            state = %entry.state,
            attempt = entry.attempt,
            "checkpointed operation"
        );
        Ok(())
    }

    pub async fn operations(&self, execution_id: Uuid) -> Result<Vec<OperationLogEntry>, CheckpointError> {
        self.repo
            .list_operations(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository error.
    #[error("repository error: {0}")]
    Repository(String),

    /// The execution was not found.
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryExecutionRepository;
    use serde_json::json;
    use skillforge_types::skill::SkillId;

    #[tokio::test]
    async fn test_save_copies_context() {
        let manager = CheckpointManager::new(InMemoryExecutionRepository::new());
        let mut execution = Execution::new(SkillId::new(), "demo");
        manager.create(&execution).await.unwrap();

        let mut ctx = ContextStore::new();
        ctx.set("quote_id", json!(42)).unwrap();
        execution.current_step = 3;
        manager.save(&mut execution, &ctx).await.unwrap();

        let loaded = manager.load(execution.id).await.unwrap();
        assert_eq!(loaded.current_step, 3);
        assert_eq!(loaded.current_context["quote_id"], json!(42));
    }

    #[tokio::test]
    async fn test_missing_execution() {
        let manager = CheckpointManager::new(InMemoryExecutionRepository::new());
        let mut execution = Execution::new(SkillId::new(), "demo");
        assert!(matches!(
            manager.persist(&mut execution).await,
            Err(CheckpointError::ExecutionNotFound(id)) if id == execution.id
        ));
        assert!(matches!(
            manager.load(Uuid::nil()).await,
            Err(CheckpointError::ExecutionNotFound(_))
        ));
    }

    #[test]
    fn checkpoint_error_display() {
        let err = CheckpointError::Repository("connection lost".to_string());
        assert!(err.to_string().contains("connection lost"));

        let err = CheckpointError::ExecutionNotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));
    }
}
