//! File snapshots of the workspace database (the `pitr_` rollback tier).
//!
//! `capture` writes a consistent copy with `VACUUM INTO`. `restore` attaches
//! the copy and replaces the contents of every workspace table with the
//! snapshot's rows in one transaction. Tables created after the capture are
//! emptied; tables dropped since are skipped. Snapshot files outlive commits
//! and process restarts until `discard` deletes them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use skillforge_core::rollback::manager::sanitize_savepoint_name;
use skillforge_core::rollback::{RollbackError, SnapshotService};
use sqlx::SqlitePool;
use uuid::Uuid;

const SNAPSHOT_EXT: &str = "db";
/// Attached schema name used during restore.
const ATTACH_AS: &str = "snapshot";

pub struct SqliteSnapshotService {
    pool: SqlitePool,
    directory: PathBuf,
    enabled: bool,
}

impl SqliteSnapshotService {
    pub fn new(pool: SqlitePool, directory: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            pool,
            directory: directory.into(),
            enabled,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_of(&self, snapshot_id: &str) -> Result<PathBuf, RollbackError> {
        let valid = !snapshot_id.is_empty()
            && snapshot_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(RollbackError::UnknownToken(snapshot_id.to_string()));
        }
        Ok(self.directory.join(format!("{snapshot_id}.{SNAPSHOT_EXT}")))
    }

    async fn capture_to(&self, name: &str) -> Result<String, RollbackError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| snapshot_err("create snapshot directory", e))?;

        let id = format!(
            "{}_{}",
            sanitize_savepoint_name(name),
            Uuid::now_v7().simple()
        );
        let path = self.path_of(&id)?;
        sqlx::query("VACUUM INTO ?")
            .bind(path.display().to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| snapshot_err("vacuum into", e))?;

        tracing::debug!(snapshot = %id, path = %path.display(), "workspace snapshot captured");
        Ok(id)
    }

    async fn restore_from(&self, snapshot_id: &str) -> Result<(), RollbackError> {
        let path = self.path_of(snapshot_id)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(RollbackError::UnknownToken(snapshot_id.to_string()));
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| snapshot_err("acquire connection", e))?;
        sqlx::query(&format!("ATTACH DATABASE ? AS {ATTACH_AS}"))
            .bind(path.display().to_string())
            .execute(&mut *conn)
            .await
            .map_err(|e| snapshot_err("attach snapshot", e))?;

        let copied = copy_tables(&mut conn).await;

        // Detach even when the copy failed so the connection returns clean
        if let Err(e) = sqlx::query(&format!("DETACH DATABASE {ATTACH_AS}"))
            .execute(&mut *conn)
            .await
        {
            tracing::warn!(snapshot = snapshot_id, error = %e, "detach after restore failed");
        }

        let tables = copied?;
        tracing::info!(snapshot = snapshot_id, tables, "workspace restored from snapshot");
        Ok(())
    }

    async fn discard_file(&self, snapshot_id: &str) -> Result<(), RollbackError> {
        let path = self.path_of(snapshot_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(snapshot = snapshot_id, "snapshot discarded");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RollbackError::UnknownToken(snapshot_id.to_string()))
            }
            Err(e) => Err(snapshot_err("remove snapshot", e)),
        }
    }
}

/// Replace every main table's rows with the attached snapshot's rows.
/// Returns the number of tables rewritten.
async fn copy_tables(conn: &mut sqlx::SqliteConnection) -> Result<usize, RollbackError> {
    let main = table_names(conn, "main").await?;
    let saved: HashSet<String> = table_names(conn, ATTACH_AS).await?.into_iter().collect();

    let mut tx = sqlx::Connection::begin(&mut *conn)
        .await
        .map_err(|e| snapshot_err("begin restore", e))?;
    sqlx::query("PRAGMA defer_foreign_keys = ON")
        .execute(&mut *tx)
        .await
        .map_err(|e| snapshot_err("defer foreign keys", e))?;

    for table in &main {
        let quoted = quote_ident(table);
        sqlx::query(&format!("DELETE FROM main.{quoted}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| snapshot_err("clear table", e))?;
        if saved.contains(table) {
            sqlx::query(&format!(
                "INSERT INTO main.{quoted} SELECT * FROM {ATTACH_AS}.{quoted}"
            ))
            .execute(&mut *tx)
            .await
            .map_err(|e| snapshot_err("copy table", e))?;
        }
    }

    tx.commit()
        .await
        .map_err(|e| snapshot_err("commit restore", e))?;
    Ok(main.len())
}

async fn table_names(
    conn: &mut sqlx::SqliteConnection,
    schema: &str,
) -> Result<Vec<String>, RollbackError> {
    let rows: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT name FROM {schema}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| snapshot_err("list tables", e))?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn snapshot_err(action: &str, e: impl std::fmt::Display) -> RollbackError {
    RollbackError::Snapshot(format!("{action}: {e}"))
}

impl SnapshotService for SqliteSnapshotService {
    fn is_available(&self) -> bool {
        self.enabled
    }

    fn capture<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, RollbackError>> {
        Box::pin(self.capture_to(name))
    }

    fn restore<'a>(&'a self, snapshot_id: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(self.restore_from(snapshot_id))
    }

    fn discard<'a>(&'a self, snapshot_id: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(self.discard_file(snapshot_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::tests::test_workspace;
    use skillforge_core::rollback::{ExecutionEnv, RollbackManager};
    use skillforge_types::execution::RollbackMode;
    use std::sync::Arc;

    async fn partners(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_as::<_, (String,)>("SELECT partner FROM quotes ORDER BY id")
            .fetch_all(pool)
            .await
            .unwrap()
            .into_iter()
            .map(|(p,)| p)
            .collect()
    }

    async fn service() -> (SqliteSnapshotService, SqlitePool, tempfile::TempDir) {
        let pool = test_workspace().await;
        sqlx::query("CREATE TABLE quotes (id INTEGER PRIMARY KEY, partner TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO quotes (partner) VALUES ('Acme')")
            .execute(&pool)
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SqliteSnapshotService::new(pool.clone(), dir.path().join("snapshots"), true);
        (snapshots, pool, dir)
    }

    #[tokio::test]
    async fn test_capture_and_restore_survive_commits() {
        let (snapshots, pool, _dir) = service().await;
        let id = snapshots.capture("create-quote").await.unwrap();
        assert!(id.starts_with("createquote_"));

        sqlx::query("INSERT INTO quotes (partner) VALUES ('Initech')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE invoices (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO invoices DEFAULT VALUES")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(partners(&pool).await, vec!["Acme", "Initech"]);

        snapshots.restore(&id).await.unwrap();
        assert_eq!(partners(&pool).await, vec!["Acme"]);
        let (invoices,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM invoices")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(invoices, 0);
    }

    #[tokio::test]
    async fn test_discard_and_unknown_ids() {
        let (snapshots, _pool, _dir) = service().await;
        let id = snapshots.capture("quote").await.unwrap();
        snapshots.discard(&id).await.unwrap();

        assert!(matches!(
            snapshots.restore(&id).await.unwrap_err(),
            RollbackError::UnknownToken(_)
        ));
        assert!(matches!(
            snapshots.discard(&id).await.unwrap_err(),
            RollbackError::UnknownToken(_)
        ));
        assert!(matches!(
            snapshots.restore("../../etc/passwd").await.unwrap_err(),
            RollbackError::UnknownToken(_)
        ));
    }

    #[tokio::test]
    async fn test_manager_prefers_snapshot_tier() {
        let (snapshots, pool, dir) = service().await;
        let manager = RollbackManager::with_snapshots(Arc::new(snapshots));
        let files = || std::fs::read_dir(dir.path().join("snapshots")).unwrap().count();

        let token = manager.create("quote", &ExecutionEnv::default()).await.unwrap();
        assert_eq!(RollbackManager::detect_mode(&token), Some(RollbackMode::Snapshot));
        assert_eq!(files(), 1);

        sqlx::query("DELETE FROM quotes").execute(&pool).await.unwrap();
        assert_eq!(manager.rollback(&token).await.unwrap(), RollbackMode::Snapshot);
        assert_eq!(partners(&pool).await, vec!["Acme"]);
        // The restored copy is not kept around
        assert_eq!(files(), 0);

        assert!(matches!(
            manager.rollback(&token).await.unwrap_err(),
            RollbackError::AlreadyConsumed(_)
        ));
    }

    #[tokio::test]
    async fn test_disabled_service_falls_back_to_savepoints() {
        let pool = test_workspace().await;
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SqliteSnapshotService::new(pool, dir.path(), false);
        let manager = RollbackManager::with_snapshots(Arc::new(snapshots));

        let err = manager.create("quote", &ExecutionEnv::default()).await.unwrap_err();
        assert!(matches!(err, RollbackError::Unavailable));
    }
}
