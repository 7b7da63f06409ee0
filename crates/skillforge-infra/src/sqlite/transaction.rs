//! Workspace transaction with real SQLite savepoints.
//!
//! `SqliteTransactionHandle` owns one open transaction on the workspace
//! database. It implements `TransactionHandle`, so the rollback manager can
//! hand out `sp_` tokens backed by `SAVEPOINT`, and SQL tools running under
//! the same `ExecutionEnv` execute inside it. Once committed or rolled back
//! every savepoint operation fails with `TransactionClosed`.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use serde_json::Value;
use skillforge_core::rollback::{RollbackError, TransactionHandle};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::tool::{run_execute, run_query};

pub struct SqliteTransactionHandle {
    id: String,
    tx: Mutex<Option<Transaction<'static, Sqlite>>>,
    open: AtomicBool,
}

impl SqliteTransactionHandle {
    /// Open a transaction on a connection taken from `pool`. The connection
    /// is held until `commit`, `rollback` or drop (which rolls back).
    pub async fn begin(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let tx = pool.begin().await?;
        let id = format!("tx_{}", Uuid::now_v7().simple());
        tracing::debug!(transaction = %id, "workspace transaction opened");
        Ok(Self {
            id,
            tx: Mutex::new(Some(tx)),
            open: AtomicBool::new(true),
        })
    }

    pub async fn commit(&self) -> Result<(), RollbackError> {
        let tx = self.close().await?;
        tx.commit().await.map_err(savepoint_err)?;
        tracing::debug!(transaction = %self.id, "workspace transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) -> Result<(), RollbackError> {
        let tx = self.close().await?;
        tx.rollback().await.map_err(savepoint_err)?;
        tracing::debug!(transaction = %self.id, "workspace transaction rolled back");
        Ok(())
    }

    /// Run a statement inside the transaction.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<Value, sqlx::Error> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(closed)?;
        run_execute(&mut **tx, sql, params).await
    }

    /// Run a query inside the transaction and return its rows as JSON objects.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Value, sqlx::Error> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(closed)?;
        run_query(&mut **tx, sql, params).await
    }

    async fn close(&self) -> Result<Transaction<'static, Sqlite>, RollbackError> {
        self.open.store(false, Ordering::SeqCst);
        self.tx
            .lock()
            .await
            .take()
            .ok_or_else(|| RollbackError::TransactionClosed(self.id.clone()))
    }

    /// Run one savepoint statement; `verb` is the statement prefix.
    async fn savepoint_statement(&self, verb: &str, name: &str) -> Result<(), RollbackError> {
        let name = checked_name(name)?;
        let mut guard = self.tx.lock().await;
        let Some(tx) = guard.as_mut() else {
            return Err(RollbackError::TransactionClosed(name.to_string()));
        };
        sqlx::query(&format!("{verb} \"{name}\""))
            .execute(&mut **tx)
            .await
            .map_err(savepoint_err)?;
        tracing::debug!(transaction = %self.id, savepoint = name, verb, "savepoint statement");
        Ok(())
    }
}

/// Savepoint names are spliced into SQL, so only identifier characters pass.
fn checked_name(name: &str) -> Result<&str, RollbackError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(RollbackError::Savepoint(format!("invalid savepoint name '{name}'")))
    }
}

fn closed() -> sqlx::Error {
    sqlx::Error::Protocol("transaction is closed".to_string())
}

fn savepoint_err(e: sqlx::Error) -> RollbackError {
    RollbackError::Savepoint(e.to_string())
}

impl TransactionHandle for SqliteTransactionHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn savepoint<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(self.savepoint_statement("SAVEPOINT", name))
    }

    fn rollback_to<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(self.savepoint_statement("ROLLBACK TO SAVEPOINT", name))
    }

    fn release<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RollbackError>> {
        Box::pin(self.savepoint_statement("RELEASE SAVEPOINT", name))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for SqliteTransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransactionHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}
