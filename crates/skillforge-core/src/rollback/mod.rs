//! Two-tier rollback: snapshot restore points and transaction savepoints.
//!
//! The storage engine behind both tiers is external. This module defines the
//! ports it must implement (`SnapshotService`, `TransactionHandle`), the
//! explicit `ExecutionEnv` threaded through every engine call, and the
//! `RollbackManager` that picks a tier and tracks token consumption.

pub mod manager;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

pub use manager::RollbackManager;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RollbackError {
    /// Neither a snapshot service nor an open transaction is available.
    #[error("no rollback mechanism available (snapshot service disabled and no open transaction)")]
    Unavailable,

    #[error("nothing to roll back: execution holds no rollback token")]
    NothingToRollBack,

    #[error("unknown rollback token '{0}'")]
    UnknownToken(String),

    #[error("rollback token '{0}' was already rolled back")]
    AlreadyConsumed(String),

    /// The savepoint's transaction was committed or rolled back.
    #[error("rollback unsupported after commit: transaction of savepoint '{0}' is closed")]
    TransactionClosed(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("savepoint error: {0}")]
    Savepoint(String),
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// A database transaction that can hold named savepoints.
///
/// Savepoints only live as long as the transaction: once it is committed
/// `is_open` turns false and every savepoint operation must fail.
pub trait TransactionHandle: Send + Sync {
    fn id(&self) -> &str;

    fn is_open(&self) -> bool;

    fn savepoint<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RollbackError>>;

    fn rollback_to<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RollbackError>>;

    fn release<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), RollbackError>>;

    /// Downcast hook for adapters that need the concrete transaction.
    fn as_any(&self) -> &dyn Any;
}

/// Captures named restore points and materializes the database back to one.
///
/// Snapshot ids must be safe to embed in a token (ASCII alphanumerics and
/// `_`). `restore` of an id the service does not know returns
/// `RollbackError::UnknownToken`.
pub trait SnapshotService: Send + Sync {
    fn is_available(&self) -> bool;

    fn capture<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, RollbackError>>;

    fn restore<'a>(&'a self, snapshot_id: &'a str) -> BoxFuture<'a, Result<(), RollbackError>>;

    fn discard<'a>(&'a self, snapshot_id: &'a str) -> BoxFuture<'a, Result<(), RollbackError>>;
}

// ---------------------------------------------------------------------------
// ExecutionEnv
// ---------------------------------------------------------------------------

/// Caller environment passed explicitly to every engine and rollback call.
#[derive(Clone, Default)]
pub struct ExecutionEnv {
    pub user_id: Option<String>,
    pub tenant: Option<String>,
    pub session_id: Option<String>,
    /// Open transaction of the current request, if any.
    pub transaction: Option<Arc<dyn TransactionHandle>>,
}

impl ExecutionEnv {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_transaction(mut self, transaction: Arc<dyn TransactionHandle>) -> Self {
        self.transaction = Some(transaction);
        self
    }
}

impl fmt::Debug for ExecutionEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEnv")
            .field("user_id", &self.user_id)
            .field("tenant", &self.tenant)
            .field("session_id", &self.session_id)
            .field("transaction", &self.transaction.as_ref().map(|t| t.id().to_string()))
            .finish()
    }
}
