//! Application state wiring all services together.
//!
//! AppState holds the concrete service used by both CLI and REST API. The
//! core `SkillService` is generic over its repositories; AppState pins it to
//! the SQLite implementations and plugs the workspace SQL tools and snapshot
//! service into the engine.

use std::path::PathBuf;
use std::sync::Arc;

use skillforge_core::engine::executor::ExecutionEngine;
use skillforge_core::engine::tool::ToolRouter;
use skillforge_core::event::bus::EventBus;
use skillforge_core::rollback::{ExecutionEnv, RollbackManager};
use skillforge_core::service::SkillService;
use skillforge_core::skill::registry::SkillRegistry;
use skillforge_infra::config::{data_dir, load_engine_config, snapshot_dir};
use skillforge_infra::sqlite::pool::{DatabasePool, open_workspace, sqlite_url};
use skillforge_infra::sqlite::{
    SqlToolInvoker, SqliteExecutionRepository, SqliteSkillRepository, SqliteSnapshotService,
};
use skillforge_types::config::EngineConfig;
use sqlx::SqlitePool;

/// Concrete service type pinned to the infra implementations.
pub type ConcreteSkillService = SkillService<SqliteExecutionRepository, SqliteSkillRepository>;

const EVENT_BUS_CAPACITY: usize = 256;

/// Shared application state.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub skill_service: Arc<ConcreteSkillService>,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
    /// Business data operated on by `sql.*` tools.
    pub workspace: SqlitePool,
}

impl AppState {
    /// Initialize the application state: open databases, wire the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;

        let db_pool = DatabasePool::new(&sqlite_url(&data_dir.join("skillforge.db"))).await?;
        let workspace = open_workspace(&sqlite_url(&data_dir.join("workspace.db"))).await?;

        let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
        let registry = Arc::new(SkillRegistry::new(
            SqliteSkillRepository::new(db_pool.clone()),
            event_bus.clone(),
        ));

        let tools = ToolRouter::with_builtins()
            .route("sql", Arc::new(SqlToolInvoker::new(workspace.clone())));

        let rollback = if config.snapshot.enabled {
            let snapshots = SqliteSnapshotService::new(
                workspace.clone(),
                snapshot_dir(&config, &data_dir),
                true,
            );
            RollbackManager::with_snapshots(Arc::new(snapshots))
        } else {
            RollbackManager::new()
        };

        let engine = ExecutionEngine::new(
            SqliteExecutionRepository::new(db_pool.clone()),
            registry,
            Arc::new(tools),
            Arc::new(rollback),
            event_bus,
            config.clone(),
        );

        tracing::debug!(
            data_dir = %data_dir.display(),
            snapshots = config.snapshot.enabled,
            "application state initialized"
        );

        Ok(Self {
            skill_service: Arc::new(SkillService::new(engine)),
            config: Arc::new(config),
            data_dir,
            db_pool,
            workspace,
        })
    }

    /// Environment for calls made on behalf of the local OS user.
    pub fn local_env(&self) -> ExecutionEnv {
        match std::env::var("USER").or_else(|_| std::env::var("USERNAME")) {
            Ok(user) if !user.is_empty() => ExecutionEnv::for_user(user),
            _ => ExecutionEnv::default(),
        }
    }
}
