//! Database pools with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. `DatabasePool` pairs a
//! multi-connection reader pool for concurrent reads with a single-connection
//! writer pool for serialized writes. It holds the engine's own tables.
//!
//! Business data touched by SQL tools lives in a separate workspace database
//! (`open_workspace`), so savepoints and snapshots never rewind engine state
//! and a held workspace transaction never blocks execution checkpoints.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::data_dir;

const ENGINE_DB_FILE: &str = "skillforge.db";
const WORKSPACE_DB_FILE: &str = "workspace.db";

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: Multi-connection pool (up to 8) for concurrent SELECT queries.
/// - `writer`: Single-connection pool for serialized INSERT/UPDATE/DELETE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Create a new DatabasePool with split reader/writer connections.
    ///
    /// Runs migrations automatically on the writer pool.
    /// Both pools use WAL journal mode, foreign key enforcement, and 5-second busy timeout.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = connect_options(database_url)?;
        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        // Run migrations on writer before opening reader pool
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(database_url, "engine database opened");
        Ok(Self { reader, writer })
    }
}

/// Open the workspace database that SQL tools operate on. No migrations:
/// its schema belongs to whoever authors the skills.
pub async fn open_workspace(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(connect_options(database_url)?)
        .await?;
    tracing::debug!(database_url, "workspace database opened");
    Ok(pool)
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true))
}

/// `sqlite://` URL of a database file.
pub fn sqlite_url(path: &Path) -> String {
    format!("sqlite://{}", path.display())
}

/// Engine database under the data directory (`SKILLFORGE_DATA_DIR`, falling
/// back to `~/.skillforge`).
pub fn default_database_url() -> String {
    sqlite_url(&data_dir().join(ENGINE_DB_FILE))
}

/// Workspace database under the data directory.
pub fn default_workspace_url() -> String {
    sqlite_url(&data_dir().join(WORKSPACE_DB_FILE))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}?mode=rwc", sqlite_url(&dir.path().join("test.db")));
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    pub(crate) async fn test_workspace() -> SqlitePool {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}?mode=rwc", sqlite_url(&dir.path().join("workspace.db")));
        std::mem::forget(dir);
        open_workspace(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_pool_creates_tables() {
        let pool = test_pool().await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            table_names,
            vec!["operation_logs", "skill_executions", "skill_stats", "skills"]
        );
    }

    #[tokio::test]
    async fn test_pool_wal_mode() {
        let pool = test_pool().await;

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(result.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_pool_foreign_keys_enforced() {
        let pool = test_pool().await;

        let result: (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(result.0, 1, "foreign keys should be enabled");
    }

    #[tokio::test]
    async fn test_workspace_has_no_engine_tables() {
        let workspace = test_workspace().await;
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE name = 'skill_executions'")
                .fetch_one(&workspace)
                .await
                .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_default_urls() {
        assert!(default_database_url().starts_with("sqlite://"));
        assert!(default_database_url().ends_with("skillforge.db"));
        assert!(default_workspace_url().ends_with("workspace.db"));
    }
}
