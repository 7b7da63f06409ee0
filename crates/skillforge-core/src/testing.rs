//! In-memory adapters for the core ports.
//!
//! Compiled for the crate's own tests and behind the `testing` feature for
//! downstream crates that want to exercise skills without SQLite. Holds
//! repositories backed by hash maps, a tool invoker that replays scripted
//! responses, plus a snapshot service and a transaction handle that only
//! record what was asked of them.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use skillforge_types::error::{RepositoryError, ToolError, ToolErrorKind};
use skillforge_types::execution::{Execution, OperationLogEntry};
use skillforge_types::skill::{Skill, SkillId, SkillState, SkillStats};
use uuid::Uuid;

use crate::engine::tool::ToolInvoker;
use crate::repository::execution::{ExecutionFilter, ExecutionRepository};
use crate::repository::skill::SkillRepository;
use crate::rollback::{ExecutionEnv, RollbackError, SnapshotService, TransactionHandle};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// Skill repository over a hash map.
#[derive(Debug, Default)]
pub struct InMemorySkillRepository {
    skills: Mutex<HashMap<String, Skill>>,
    stats: Mutex<HashMap<String, SkillStats>>,
}

impl InMemorySkillRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SkillRepository for InMemorySkillRepository {
    async fn save_skill(&self, skill: &Skill) -> Result<(), RepositoryError> {
        lock(&self.skills).insert(skill.technical_name.clone(), skill.clone());
        Ok(())
    }

    async fn get_skill(&self, technical_name: &str) -> Result<Option<Skill>, RepositoryError> {
        Ok(lock(&self.skills).get(technical_name).cloned())
    }

    async fn get_skill_by_id(&self, id: &SkillId) -> Result<Option<Skill>, RepositoryError> {
        Ok(lock(&self.skills).values().find(|s| s.id == *id).cloned())
    }

    async fn list_skills(&self, state: Option<SkillState>) -> Result<Vec<Skill>, RepositoryError> {
        let mut skills: Vec<Skill> = lock(&self.skills)
            .values()
            .filter(|s| state.is_none_or(|st| s.state == st))
            .cloned()
            .collect();
        skills.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.technical_name.cmp(&b.technical_name))
        });
        Ok(skills)
    }

    async fn set_state(&self, technical_name: &str, state: SkillState) -> Result<(), RepositoryError> {
        let mut skills = lock(&self.skills);
        let skill = skills.get_mut(technical_name).ok_or(RepositoryError::NotFound)?;
        skill.state = state;
        Ok(())
    }

    async fn delete_skill(&self, technical_name: &str) -> Result<bool, RepositoryError> {
        lock(&self.stats).remove(technical_name);
        Ok(lock(&self.skills).remove(technical_name).is_some())
    }

    async fn record_outcome(
        &self,
        technical_name: &str,
        success: bool,
        duration_ms: u64,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        lock(&self.stats)
            .entry(technical_name.to_string())
            .or_default()
            .record(success, duration_ms, at);
        Ok(())
    }

    async fn get_stats(&self, technical_name: &str) -> Result<SkillStats, RepositoryError> {
        Ok(lock(&self.stats).get(technical_name).cloned().unwrap_or_default())
    }
}

/// Execution repository over a hash map and a vector.
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: Mutex<HashMap<Uuid, Execution>>,
    operations: Mutex<Vec<OperationLogEntry>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut executions = lock(&self.executions);
        if executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut executions = lock(&self.executions);
        let slot = executions
            .get_mut(&execution.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = execution.clone();
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(lock(&self.executions).get(id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, RepositoryError> {
        let mut executions: Vec<Execution> = lock(&self.executions)
            .values()
            .filter(|e| filter.include_children || e.parent_execution_id.is_none())
            .filter(|e| filter.skill_name.as_ref().is_none_or(|n| &e.skill_name == n))
            .filter(|e| filter.state.is_none_or(|s| e.state == s))
            .filter(|e| {
                filter
                    .user_id
                    .as_ref()
                    .is_none_or(|u| e.user_id.as_ref() == Some(u))
            })
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            executions.truncate(limit as usize);
        }
        Ok(executions)
    }

    async fn append_operation(&self, entry: &OperationLogEntry) -> Result<(), RepositoryError> {
        lock(&self.operations).push(entry.clone());
        Ok(())
    }

    async fn list_operations(&self, execution_id: &Uuid) -> Result<Vec<OperationLogEntry>, RepositoryError> {
        Ok(lock(&self.operations)
            .iter()
            .filter(|e| e.execution_id == *execution_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedToolInvoker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Scripted {
    result: Result<Value, ToolError>,
    delay: Option<Duration>,
}

/// Tool invoker that replays scripted results per tool name.
///
/// Results are consumed in order; the last one scripted for a tool is
/// replayed for every further call. Calls to unscripted tools fail with
/// `ToolErrorKind::NotFound`.
#[derive(Debug, Default)]
pub struct ScriptedToolInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl ScriptedToolInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, tool: &str, value: Value) {
        self.push(tool, Ok(value), None);
    }

    /// Respond after sleeping for `delay`.
    pub fn respond_after(&self, tool: &str, value: Value, delay: Duration) {
        self.push(tool, Ok(value), Some(delay));
    }

    pub fn fail(&self, tool: &str, kind: ToolErrorKind, message: &str) {
        self.push(tool, Err(ToolError::new(kind, message)), None);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        lock(&self.calls).clone()
    }

    fn push(&self, tool: &str, result: Result<Value, ToolError>, delay: Option<Duration>) {
        lock(&self.scripts)
            .entry(tool.to_string())
            .or_default()
            .push_back(Scripted { result, delay });
    }

    fn next(&self, tool: &str) -> Option<Scripted> {
        let mut scripts = lock(&self.scripts);
        let queue = scripts.get_mut(tool)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl ToolInvoker for ScriptedToolInvoker {
    fn invoke<'a>(
        &'a self,
        tool: &'a str,
        params: Map<String, Value>,
        _env: &'a ExecutionEnv,
    ) -> BoxFuture<'a, Result<Value, ToolError>> {
        lock(&self.calls).push((tool.to_string(), params));
        let scripted = self.next(tool);
        Box::pin(async move {
            let Some(scripted) = scripted else {
                return Err(ToolError::not_found(tool));
            };
            if let Some(delay) = scripted.delay {
                tokio::time::sleep(delay).await;
            }
            scripted.result
        })
    }
}

// ---------------------------------------------------------------------------
// InMemorySnapshotService
// ---------------------------------------------------------------------------

/// Snapshot service that keeps named restore points in memory.
#[derive(Debug)]
pub struct InMemorySnapshotService {
    available: AtomicBool,
    next_id: AtomicU64,
    snapshots: Mutex<HashMap<String, String>>,
    restored: Mutex<Vec<String>>,
}

impl Default for InMemorySnapshotService {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            snapshots: Mutex::new(HashMap::new()),
            restored: Mutex::new(Vec::new()),
        }
    }
}

impl InMemorySnapshotService {
    /// An available service with no snapshots.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot ids restored so far, in order.
    pub fn restored(&self) -> Vec<String> {
        lock(&self.restored).clone()
    }

    /// Number of live snapshots.
    pub fn len(&self) -> usize {
        lock(&self.snapshots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotService for InMemorySnapshotService {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn capture<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, RollbackError>> {
        Box::pin(async move {
            if !self.is_available() {
                return Err(RollbackError::Snapshot("snapshot service unavailable".to_string()));
            }
            let id = format!("mem{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            lock(&self.snapshots).insert(id.clone(), name.to_string());
            Ok(id)
        })
    }

    fn restore<'a>(&'a self, snapshot_id: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(async move {
            if !lock(&self.snapshots).contains_key(snapshot_id) {
                return Err(RollbackError::UnknownToken(snapshot_id.to_string()));
            }
            lock(&self.restored).push(snapshot_id.to_string());
            Ok(())
        })
    }

    fn discard<'a>(&'a self, snapshot_id: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(async move {
            match lock(&self.snapshots).remove(snapshot_id) {
                Some(_) => Ok(()),
                None => Err(RollbackError::UnknownToken(snapshot_id.to_string())),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// InMemoryTransaction
// ---------------------------------------------------------------------------

/// Transaction handle that tracks savepoints with SQL semantics: rolling
/// back to a savepoint keeps it, releasing it drops it and every later one.
#[derive(Debug)]
pub struct InMemoryTransaction {
    id: String,
    open: AtomicBool,
    savepoints: Mutex<Vec<String>>,
    rolled_back_to: Mutex<Vec<String>>,
}

impl Default for InMemoryTransaction {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().simple().to_string(),
            open: AtomicBool::new(true),
            savepoints: Mutex::new(Vec::new()),
            rolled_back_to: Mutex::new(Vec::new()),
        }
    }
}

impl InMemoryTransaction {
    /// An open transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the transaction; its savepoints die with it.
    pub fn commit(&self) {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.savepoints).clear();
    }

    pub fn savepoints(&self) -> Vec<String> {
        lock(&self.savepoints).clone()
    }

    pub fn rolled_back_to(&self) -> Vec<String> {
        lock(&self.rolled_back_to).clone()
    }

    fn position(&self, name: &str) -> Result<usize, RollbackError> {
        if !self.is_open() {
            return Err(RollbackError::TransactionClosed(name.to_string()));
        }
        lock(&self.savepoints)
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| RollbackError::Savepoint(format!("no such savepoint: {name}")))
    }
}

impl TransactionHandle for InMemoryTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn savepoint<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(RollbackError::TransactionClosed(name.to_string()));
            }
            lock(&self.savepoints).push(name.to_string());
            Ok(())
        })
    }

    fn rollback_to<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(async move {
            let position = self.position(name)?;
            lock(&self.savepoints).truncate(position + 1);
            lock(&self.rolled_back_to).push(name.to_string());
            Ok(())
        })
    }

    fn release<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(async move {
            let position = self.position(name)?;
            lock(&self.savepoints).truncate(position);
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_invoker_replays_last_result() {
        let tools = ScriptedToolInvoker::new();
        tools.fail("x.y", ToolErrorKind::Execution, "first");
        tools.respond("x.y", json!(1));
        let env = ExecutionEnv::default();

        assert!(tools.invoke("x.y", Map::new(), &env).await.is_err());
        assert_eq!(tools.invoke("x.y", Map::new(), &env).await.unwrap(), json!(1));
        assert_eq!(tools.invoke("x.y", Map::new(), &env).await.unwrap(), json!(1));
        assert_eq!(
            tools.invoke("nope", Map::new(), &env).await.unwrap_err().kind,
            ToolErrorKind::NotFound
        );
        assert_eq!(tools.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_transaction_savepoint_semantics() {
        let tx = InMemoryTransaction::new();
        tx.savepoint("a").await.unwrap();
        tx.savepoint("b").await.unwrap();
        tx.savepoint("c").await.unwrap();

        tx.rollback_to("b").await.unwrap();
        assert_eq!(tx.savepoints(), vec!["a", "b"]);
        tx.release("a").await.unwrap();
        assert!(tx.savepoints().is_empty());

        tx.commit();
        assert!(matches!(
            tx.savepoint("d").await,
            Err(RollbackError::TransactionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_list_executions_filters_children() {
        let repo = InMemoryExecutionRepository::new();
        let parent = Execution::new(SkillId::new(), "parent");
        let mut child = Execution::new(SkillId::new(), "child");
        child.parent_execution_id = Some(parent.id);
        repo.create_execution(&parent).await.unwrap();
        repo.create_execution(&child).await.unwrap();
        assert!(repo.create_execution(&parent).await.is_err());

        let top = repo.list_executions(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(top.len(), 1);
        let all = repo
            .list_executions(&ExecutionFilter {
                include_children: true,
                ..ExecutionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
