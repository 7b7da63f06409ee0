//! SQLite execution repository implementation.
//!
//! Implements `ExecutionRepository` from `skillforge-core`. The complete
//! execution record (cursor, loop stack, context, pending prompt) is stored
//! as JSON in `record`; the remaining columns mirror the fields that list
//! filters and operators query. Operation log rows are append-only.

use skillforge_core::repository::execution::{ExecutionFilter, ExecutionRepository};
use skillforge_types::error::RepositoryError;
use skillforge_types::execution::{Execution, OperationLogEntry};
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{
    format_datetime, is_foreign_key_violation, is_unique_violation, parse_datetime, parse_uuid,
    query_err,
};

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Execution, RepositoryError> {
    let record: String = row.try_get("record").map_err(query_err)?;
    serde_json::from_str(&record)
        .map_err(|e| RepositoryError::Query(format!("invalid execution record JSON: {e}")))
}

struct OperationRow {
    id: String,
    execution_id: String,
    step_id: String,
    tool_name: String,
    operation_type: String,
    parameters: String,
    result: Option<String>,
    error_message: Option<String>,
    state: String,
    attempt: i64,
    duration_ms: i64,
    created_at: String,
}

impl OperationRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            tool_name: row.try_get("tool_name")?,
            operation_type: row.try_get("operation_type")?,
            parameters: row.try_get("parameters")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            state: row.try_get("state")?,
            attempt: row.try_get("attempt")?,
            duration_ms: row.try_get("duration_ms")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<OperationLogEntry, RepositoryError> {
        let parameters = serde_json::from_str(&self.parameters)
            .map_err(|e| RepositoryError::Query(format!("invalid operation parameters: {e}")))?;
        let result = self
            .result
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid operation result: {e}")))
            })
            .transpose()?;

        Ok(OperationLogEntry {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            tool_name: self.tool_name,
            operation_type: self.operation_type.parse().map_err(RepositoryError::Query)?,
            parameters,
            result,
            error_message: self.error_message,
            state: self.state.parse().map_err(RepositoryError::Query)?,
            attempt: self.attempt.max(1) as u32,
            duration_ms: self.duration_ms.max(0) as u64,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn serialize_record(execution: &Execution) -> Result<String, RepositoryError> {
    serde_json::to_string(execution)
        .map_err(|e| RepositoryError::Query(format!("serialize execution: {e}")))
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let record = serialize_record(execution)?;

        sqlx::query(
            r#"INSERT INTO skill_executions
               (id, skill_id, skill_name, user_id, session_id, state, current_step, steps_completed,
                snapshot_token, savepoint_token, rollback_mode, error_message, error_step_id,
                result_summary, parent_execution_id, depth, record, created_at, started_at,
                completed_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.skill_id.to_string())
        .bind(&execution.skill_name)
        .bind(&execution.user_id)
        .bind(&execution.session_id)
        .bind(execution.state.to_string())
        .bind(execution.current_step as i64)
        .bind(execution.steps_completed as i64)
        .bind(&execution.snapshot_token)
        .bind(&execution.savepoint_token)
        .bind(execution.rollback_mode.map(|m| m.to_string()))
        .bind(&execution.error_message)
        .bind(&execution.error_step_id)
        .bind(&execution.result_summary)
        .bind(execution.parent_execution_id.map(|id| id.to_string()))
        .bind(execution.depth as i64)
        .bind(&record)
        .bind(format_datetime(&execution.created_at))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("execution {} already exists", execution.id))
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let record = serialize_record(execution)?;

        let result = sqlx::query(
            r#"UPDATE skill_executions SET
                 user_id = ?, session_id = ?, state = ?, current_step = ?, steps_completed = ?,
                 snapshot_token = ?, savepoint_token = ?, rollback_mode = ?, error_message = ?,
                 error_step_id = ?, result_summary = ?, record = ?, started_at = ?,
                 completed_at = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&execution.user_id)
        .bind(&execution.session_id)
        .bind(execution.state.to_string())
        .bind(execution.current_step as i64)
        .bind(execution.steps_completed as i64)
        .bind(&execution.snapshot_token)
        .bind(&execution.savepoint_token)
        .bind(execution.rollback_mode.map(|m| m.to_string()))
        .bind(&execution.error_message)
        .bind(&execution.error_step_id)
        .bind(&execution.result_summary)
        .bind(&record)
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.updated_at))
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT record FROM skill_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT record FROM skill_executions WHERE 1 = 1");
        if !filter.include_children {
            query.push(" AND parent_execution_id IS NULL");
        }
        if let Some(skill_name) = &filter.skill_name {
            query.push(" AND skill_name = ").push_bind(skill_name.clone());
        }
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.to_string());
        }
        if let Some(user_id) = &filter.user_id {
            query.push(" AND user_id = ").push_bind(user_id.clone());
        }
        query.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn append_operation(&self, entry: &OperationLogEntry) -> Result<(), RepositoryError> {
        let parameters = serde_json::to_string(&entry.parameters)
            .map_err(|e| RepositoryError::Query(format!("serialize parameters: {e}")))?;
        let result = entry
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize result: {e}")))?;

        sqlx::query(
            r#"INSERT INTO operation_logs
               (id, execution_id, step_id, tool_name, operation_type, parameters, result,
                error_message, state, attempt, duration_ms, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.execution_id.to_string())
        .bind(&entry.step_id)
        .bind(&entry.tool_name)
        .bind(entry.operation_type.to_string())
        .bind(&parameters)
        .bind(&result)
        .bind(&entry.error_message)
        .bind(entry.state.to_string())
        .bind(i64::from(entry.attempt))
        .bind(entry.duration_ms as i64)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                RepositoryError::NotFound
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    async fn list_operations(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<OperationLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM operation_logs WHERE execution_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(OperationRow::from_row(row).map_err(query_err)?.into_entry()?);
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::tests::test_pool;
    use chrono::Utc;
    use serde_json::json;
    use skillforge_types::execution::{ExecutionState, OperationState, OperationType, PendingInput};
    use skillforge_types::skill::{InputType, SkillId};

    fn sample_execution(skill: &str) -> Execution {
        let mut execution = Execution::new(SkillId::new(), skill);
        execution.user_id = Some("alice".to_string());
        execution
    }

    fn sample_operation(execution_id: Uuid, attempt: u32) -> OperationLogEntry {
        OperationLogEntry {
            id: Uuid::now_v7(),
            execution_id,
            step_id: "create".to_string(),
            tool_name: "sale.create_quote".to_string(),
            operation_type: OperationType::ToolCall,
            parameters: json!({"partner": "Acme"}),
            result: (attempt > 1).then(|| json!(42)),
            error_message: (attempt == 1).then(|| "timeout".to_string()),
            state: if attempt > 1 {
                OperationState::Success
            } else {
                OperationState::Failed
            },
            attempt,
            duration_ms: 12,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_execution() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution("create_quote");
        repo.create_execution(&execution).await.unwrap();

        let loaded = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, execution.id);
        assert_eq!(loaded.state, ExecutionState::Pending);
        assert_eq!(loaded.user_id.as_deref(), Some("alice"));
        assert!(repo.get_execution(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_conflicts() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution("create_quote");
        repo.create_execution(&execution).await.unwrap();
        let err = repo.create_execution(&execution).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_save_round_trips_suspension_state() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let mut execution = sample_execution("create_quote");
        repo.create_execution(&execution).await.unwrap();

        execution.state = ExecutionState::WaitingInput;
        execution.current_step = 2;
        execution.steps_completed = 2;
        execution.started_at = Some(Utc::now());
        execution.savepoint_token = Some("sp_create_quote_1".to_string());
        execution.current_context.insert("quote_id".to_string(), json!(42));
        execution.pending_input = Some(PendingInput {
            prompt: "Which customer?".to_string(),
            input_type: InputType::Text,
            options: Vec::new(),
            variable: "partner".to_string(),
            step_id: "ask".to_string(),
            child_execution_id: None,
        });
        repo.save_execution(&execution).await.unwrap();

        let loaded = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, ExecutionState::WaitingInput);
        assert_eq!(loaded.current_step, 2);
        assert_eq!(loaded.current_context["quote_id"], json!(42));
        assert_eq!(loaded.pending_input.unwrap().variable, "partner");
        assert_eq!(loaded.savepoint_token.as_deref(), Some("sp_create_quote_1"));
    }

    #[tokio::test]
    async fn test_save_missing_is_not_found() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let err = repo
            .save_execution(&sample_execution("create_quote"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_list_filters_children_and_state() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let parent = sample_execution("onboard");
        repo.create_execution(&parent).await.unwrap();

        let mut child = sample_execution("address");
        child.parent_execution_id = Some(parent.id);
        child.depth = 1;
        repo.create_execution(&child).await.unwrap();

        let mut done = sample_execution("create_quote");
        done.state = ExecutionState::Completed;
        done.user_id = Some("bob".to_string());
        repo.create_execution(&done).await.unwrap();

        let top = repo.list_executions(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].id, done.id, "newest first");

        let all = repo
            .list_executions(&ExecutionFilter {
                include_children: true,
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let completed = repo
            .list_executions(&ExecutionFilter {
                state: Some(ExecutionState::Completed),
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);

        let alice = repo
            .list_executions(&ExecutionFilter {
                user_id: Some("alice".to_string()),
                skill_name: Some("onboard".to_string()),
                limit: Some(1),
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id, parent.id);
    }

    #[tokio::test]
    async fn test_operation_log() {
        let repo = SqliteExecutionRepository::new(test_pool().await);
        let execution = sample_execution("create_quote");
        repo.create_execution(&execution).await.unwrap();

        repo.append_operation(&sample_operation(execution.id, 1)).await.unwrap();
        repo.append_operation(&sample_operation(execution.id, 2)).await.unwrap();

        let ops = repo.list_operations(&execution.id).await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].attempt, 1);
        assert_eq!(ops[0].state, OperationState::Failed);
        assert_eq!(ops[0].error_message.as_deref(), Some("timeout"));
        assert_eq!(ops[1].result, Some(json!(42)));
        assert_eq!(ops[1].operation_type, OperationType::ToolCall);

        let orphan = repo
            .append_operation(&sample_operation(Uuid::now_v7(), 1))
            .await
            .unwrap_err();
        assert!(matches!(orphan, RepositoryError::NotFound));
    }
}
