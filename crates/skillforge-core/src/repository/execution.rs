//! Execution repository trait definition.
//!
//! Stores execution records (the durable cursor of every run) and the
//! append-only operation log.

use skillforge_types::error::RepositoryError;
use skillforge_types::execution::{Execution, ExecutionState, OperationLogEntry};
use uuid::Uuid;

/// Filter for execution list queries.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub skill_name: Option<String>,
    pub state: Option<ExecutionState>,
    pub user_id: Option<String>,
    /// Include nested subskill executions (default: top-level only).
    pub include_children: bool,
    pub limit: Option<u32>,
}

/// Repository trait for execution persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    /// Create a new execution record.
    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist the full current state of an execution (checkpoint).
    /// `NotFound` if it was never created.
    fn save_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// List executions, newest first.
    fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Append an operation log entry.
    fn append_operation(
        &self,
        entry: &OperationLogEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Operation log of an execution, oldest first.
    fn list_operations(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<OperationLogEntry>, RepositoryError>> + Send;
}
