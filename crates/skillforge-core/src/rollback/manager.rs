//! Rollback manager: creates, applies and releases rollback tokens.
//!
//! `create` prefers the snapshot tier when a snapshot service is available
//! and falls back to a savepoint on the caller's open transaction. The mode
//! of a token is encoded in its prefix, so `detect_mode` never consults the
//! current availability of either tier.
//!
//! Tokens are single-use: once rolled back the ledger keeps only a consumed
//! marker and the restored snapshot is discarded. Savepoint tokens die with
//! their transaction; the ledger drops its handle on the next `create`.

use std::sync::Arc;

use dashmap::DashMap;
use skillforge_types::execution::{RollbackMode, SAVEPOINT_TOKEN_PREFIX, SNAPSHOT_TOKEN_PREFIX};
use uuid::Uuid;

use super::{ExecutionEnv, RollbackError, SnapshotService, TransactionHandle};

/// Suffix length taken from a UUIDv7 to keep savepoint tokens unique.
const TOKEN_SUFFIX_LEN: usize = 12;

#[derive(Clone)]
enum Point {
    Snapshot { id: String },
    Savepoint { transaction: Arc<dyn TransactionHandle> },
}

/// What the ledger remembers about an issued token.
///
/// Only `Live` entries hold resources. Spent tokens keep a bare marker so
/// that reusing them reports why.
enum Entry {
    Live(Point),
    /// Rolled back; the snapshot (if any) has been discarded.
    Consumed,
    /// A savepoint whose transaction has ended.
    Closed,
}

/// Chooses a rollback tier and tracks issued tokens.
pub struct RollbackManager {
    snapshots: Option<Arc<dyn SnapshotService>>,
    ledger: DashMap<String, Entry>,
}

impl RollbackManager {
    /// A manager with only the savepoint tier.
    pub fn new() -> Self {
        Self {
            snapshots: None,
            ledger: DashMap::new(),
        }
    }

    pub fn with_snapshots(snapshots: Arc<dyn SnapshotService>) -> Self {
        Self {
            snapshots: Some(snapshots),
            ledger: DashMap::new(),
        }
    }

    /// Classify a token by prefix alone.
    pub fn detect_mode(token: &str) -> Option<RollbackMode> {
        RollbackMode::of_token(token)
    }

    /// Whether the snapshot tier would be used by `create` right now.
    pub fn snapshots_available(&self) -> bool {
        self.snapshots.as_ref().is_some_and(|s| s.is_available())
    }

    /// Number of tokens that still hold a snapshot or a transaction.
    pub fn live_points(&self) -> usize {
        self.prune_closed();
        self.ledger
            .iter()
            .filter(|entry| matches!(entry.value(), Entry::Live(_)))
            .count()
    }

    /// Open a compensation point named after `name`.
    pub async fn create(&self, name: &str, env: &ExecutionEnv) -> Result<String, RollbackError> {
        self.prune_closed();

        if let Some(snapshots) = self.snapshots.as_ref().filter(|s| s.is_available()) {
            let id = snapshots.capture(name).await?;
            let token = format!("{SNAPSHOT_TOKEN_PREFIX}{id}");
            self.ledger
                .insert(token.clone(), Entry::Live(Point::Snapshot { id }));
            tracing::debug!(token, name, "snapshot rollback point created");
            return Ok(token);
        }

        let Some(transaction) = env.transaction.as_ref().filter(|t| t.is_open()) else {
            return Err(RollbackError::Unavailable);
        };

        let token = savepoint_token(name);
        transaction.savepoint(&token).await?;
        self.ledger.insert(
            token.clone(),
            Entry::Live(Point::Savepoint {
                transaction: Arc::clone(transaction),
            }),
        );
        tracing::debug!(
            token,
            name,
            transaction = transaction.id(),
            "savepoint rollback point created"
        );
        Ok(token)
    }

    /// Apply a token. Returns the mode that was used.
    pub async fn rollback(&self, token: &str) -> Result<RollbackMode, RollbackError> {
        let Some(mode) = Self::detect_mode(token) else {
            return Err(RollbackError::UnknownToken(token.to_string()));
        };

        let claimed = self.ledger.get_mut(token).map(|mut entry| {
            match std::mem::replace(&mut *entry, Entry::Consumed) {
                Entry::Live(point) => Ok(point),
                Entry::Consumed => Err(RollbackError::AlreadyConsumed(token.to_string())),
                Entry::Closed => {
                    *entry = Entry::Closed;
                    Err(RollbackError::TransactionClosed(token.to_string()))
                }
            }
        });
        let point = match claimed {
            Some(point) => point?,
            None => return self.rollback_untracked(token, mode).await,
        };

        let result = match &point {
            Point::Snapshot { id } => self.restore(id).await,
            Point::Savepoint { transaction } => {
                if transaction.is_open() {
                    transaction.rollback_to(token).await
                } else {
                    Err(RollbackError::TransactionClosed(token.to_string()))
                }
            }
        };

        if let Err(e) = result {
            let back = match (&e, point) {
                (RollbackError::TransactionClosed(_), Point::Savepoint { .. }) => Entry::Closed,
                (_, point) => Entry::Live(point),
            };
            self.ledger.insert(token.to_string(), back);
            tracing::warn!(token, error = %e, "rollback failed");
            return Err(e);
        }

        if let Point::Snapshot { id } = &point {
            self.discard_spent(id).await;
        }
        tracing::info!(token, %mode, "rolled back");
        Ok(mode)
    }

    /// Discard a token without applying it. Spent tokens hold nothing, so
    /// releasing them again succeeds.
    pub async fn release(&self, token: &str) -> Result<(), RollbackError> {
        let live = match self.ledger.get(token).map(|entry| matches!(entry.value(), Entry::Live(_))) {
            Some(true) => true,
            Some(false) => return Ok(()),
            None => false,
        };
        if !live {
            return match (Self::detect_mode(token), &self.snapshots) {
                (Some(RollbackMode::Snapshot), Some(snapshots)) => {
                    snapshots.discard(&token[SNAPSHOT_TOKEN_PREFIX.len()..]).await
                }
                _ => Err(RollbackError::UnknownToken(token.to_string())),
            };
        }

        let Some((_, Entry::Live(point))) = self.ledger.remove(token) else {
            return Ok(());
        };
        match point {
            Point::Snapshot { id } => match &self.snapshots {
                Some(snapshots) => snapshots.discard(&id).await,
                None => Ok(()),
            },
            // Savepoints vanish with their transaction anyway
            Point::Savepoint { transaction } if transaction.is_open() => {
                transaction.release(token).await
            }
            Point::Savepoint { .. } => Ok(()),
        }
    }

    /// A token issued by an earlier process: only snapshots survive that.
    async fn rollback_untracked(
        &self,
        token: &str,
        mode: RollbackMode,
    ) -> Result<RollbackMode, RollbackError> {
        if mode == RollbackMode::Savepoint {
            return Err(RollbackError::UnknownToken(token.to_string()));
        }
        let id = &token[SNAPSHOT_TOKEN_PREFIX.len()..];
        self.restore(id).await?;
        self.ledger.insert(token.to_string(), Entry::Consumed);
        self.discard_spent(id).await;
        tracing::info!(token, "rolled back to snapshot from an earlier process");
        Ok(mode)
    }

    async fn restore(&self, id: &str) -> Result<(), RollbackError> {
        match &self.snapshots {
            Some(snapshots) => snapshots.restore(id).await,
            None => Err(RollbackError::Snapshot(
                "snapshot service is not configured".to_string(),
            )),
        }
    }

    /// Drop a snapshot that has been restored.
    async fn discard_spent(&self, id: &str) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        if let Err(e) = snapshots.discard(id).await {
            tracing::warn!(snapshot = id, error = %e, "restored snapshot not discarded");
        }
    }

    /// Let go of transactions that have committed or rolled back.
    fn prune_closed(&self) {
        for mut entry in self.ledger.iter_mut() {
            let closed = matches!(
                entry.value(),
                Entry::Live(Point::Savepoint { transaction }) if !transaction.is_open()
            );
            if closed {
                *entry.value_mut() = Entry::Closed;
            }
        }
    }
}

impl Default for RollbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackManager")
            .field("snapshots", &self.snapshots.is_some())
            .field("tokens", &self.ledger.len())
            .field("live", &self.live_points())
            .finish()
    }
}

/// Keep only identifier-safe characters; never return an empty name.
pub fn sanitize_savepoint_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "rollback".to_string()
    } else {
        cleaned
    }
}

fn savepoint_token(name: &str) -> String {
    let unique = Uuid::now_v7().simple().to_string();
    let suffix = &unique[unique.len() - TOKEN_SUFFIX_LEN..];
    format!(
        "{SAVEPOINT_TOKEN_PREFIX}{}_{suffix}",
        sanitize_savepoint_name(name)
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemorySnapshotService, InMemoryTransaction};

    fn env_with(tx: &Arc<InMemoryTransaction>) -> ExecutionEnv {
        ExecutionEnv::default().with_transaction(tx.clone() as Arc<dyn TransactionHandle>)
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_savepoint_name("test-operation.name!@#"), "testoperationname");
        assert_eq!(sanitize_savepoint_name("!!!"), "rollback");
        assert_eq!(sanitize_savepoint_name("sale_quote_1"), "sale_quote_1");
    }

    #[tokio::test]
    async fn test_savepoint_token_is_safe_and_unique() {
        let manager = RollbackManager::new();
        let tx = Arc::new(InMemoryTransaction::new());
        let env = env_with(&tx);

        let a = manager.create("test-operation.name!@#", &env).await.unwrap();
        let b = manager.create("test-operation.name!@#", &env).await.unwrap();
        assert_ne!(a, b);
        for token in [&a, &b] {
            assert!(token.starts_with("sp_testoperationname_"));
            assert!(!token.contains(['!', '@', '#', '-', '.']));
        }
        assert_eq!(RollbackManager::detect_mode(&a), Some(RollbackMode::Savepoint));
        assert_eq!(tx.savepoints(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_unavailable_without_any_tier() {
        let manager = RollbackManager::new();
        assert_eq!(
            manager.create("x", &ExecutionEnv::default()).await,
            Err(RollbackError::Unavailable)
        );

        let tx = Arc::new(InMemoryTransaction::new());
        tx.commit();
        assert_eq!(
            manager.create("x", &env_with(&tx)).await,
            Err(RollbackError::Unavailable)
        );
    }

    #[tokio::test]
    async fn test_snapshot_preferred_when_available() {
        let snapshots = Arc::new(InMemorySnapshotService::new());
        let manager = RollbackManager::with_snapshots(snapshots.clone());
        let tx = Arc::new(InMemoryTransaction::new());

        let token = manager.create("quote", &env_with(&tx)).await.unwrap();
        assert!(token.starts_with("pitr_"));
        assert_eq!(RollbackManager::detect_mode(&token), Some(RollbackMode::Snapshot));
        assert!(tx.savepoints().is_empty());

        snapshots.set_available(false);
        let token = manager.create("quote", &env_with(&tx)).await.unwrap();
        assert!(token.starts_with("sp_"));
    }

    #[tokio::test]
    async fn test_rollback_is_single_use() {
        let snapshots = Arc::new(InMemorySnapshotService::new());
        let manager = RollbackManager::with_snapshots(snapshots.clone());
        let token = manager.create("q", &ExecutionEnv::default()).await.unwrap();

        assert_eq!(manager.rollback(&token).await, Ok(RollbackMode::Snapshot));
        assert_eq!(snapshots.restored().len(), 1);
        assert_eq!(
            manager.rollback(&token).await,
            Err(RollbackError::AlreadyConsumed(token.clone()))
        );

        let tx = Arc::new(InMemoryTransaction::new());
        let token = manager.create("q", &env_with(&tx)).await;
        // snapshot tier still wins
        assert!(token.unwrap().starts_with("pitr_"));
    }

    #[tokio::test]
    async fn test_savepoint_after_commit_fails() {
        let manager = RollbackManager::new();
        let tx = Arc::new(InMemoryTransaction::new());
        let token = manager.create("q", &env_with(&tx)).await.unwrap();

        tx.commit();
        assert_eq!(
            manager.rollback(&token).await,
            Err(RollbackError::TransactionClosed(token.clone()))
        );
    }

    #[tokio::test]
    async fn test_savepoint_rollback_while_open() {
        let manager = RollbackManager::new();
        let tx = Arc::new(InMemoryTransaction::new());
        let token = manager.create("q", &env_with(&tx)).await.unwrap();

        assert_eq!(manager.rollback(&token).await, Ok(RollbackMode::Savepoint));
        assert_eq!(tx.rolled_back_to(), vec![token.clone()]);
        assert!(matches!(
            manager.rollback(&token).await,
            Err(RollbackError::AlreadyConsumed(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_tokens() {
        let manager = RollbackManager::new();
        assert!(matches!(
            manager.rollback("bogus").await,
            Err(RollbackError::UnknownToken(_))
        ));
        assert!(matches!(
            manager.rollback("sp_never_issued_000000000000").await,
            Err(RollbackError::UnknownToken(_))
        ));
        assert!(matches!(
            manager.release("pitr_nope").await,
            Err(RollbackError::UnknownToken(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_token_survives_manager_restart() {
        let snapshots = Arc::new(InMemorySnapshotService::new());
        let first = RollbackManager::with_snapshots(snapshots.clone());
        let token = first.create("q", &ExecutionEnv::default()).await.unwrap();

        let second = RollbackManager::with_snapshots(snapshots.clone());
        assert_eq!(second.rollback(&token).await, Ok(RollbackMode::Snapshot));
        assert!(matches!(
            second.rollback(&token).await,
            Err(RollbackError::AlreadyConsumed(_))
        ));
    }

    #[tokio::test]
    async fn test_release_discards_without_applying() {
        let snapshots = Arc::new(InMemorySnapshotService::new());
        let manager = RollbackManager::with_snapshots(snapshots.clone());
        let token = manager.create("q", &ExecutionEnv::default()).await.unwrap();

        manager.release(&token).await.unwrap();
        assert!(snapshots.restored().is_empty());
        assert_eq!(snapshots.len(), 0);
        assert!(matches!(
            manager.rollback(&token).await,
            Err(RollbackError::UnknownToken(_))
        ));
    }

    #[tokio::test]
    async fn test_spent_tokens_hold_no_snapshot() {
        let snapshots = Arc::new(InMemorySnapshotService::new());
        let manager = RollbackManager::with_snapshots(snapshots.clone());

        for _ in 0..100 {
            let token = manager.create("q", &ExecutionEnv::default()).await.unwrap();
            manager.rollback(&token).await.unwrap();
            manager.release(&token).await.unwrap();
            assert!(matches!(
                manager.rollback(&token).await,
                Err(RollbackError::AlreadyConsumed(_))
            ));
        }
        assert!(snapshots.is_empty());
        assert_eq!(snapshots.restored().len(), 100);
        assert_eq!(manager.live_points(), 0);
    }

    #[tokio::test]
    async fn test_untracked_snapshot_discarded_after_restore() {
        let snapshots = Arc::new(InMemorySnapshotService::new());
        let token = RollbackManager::with_snapshots(snapshots.clone())
            .create("q", &ExecutionEnv::default())
            .await
            .unwrap();

        let restarted = RollbackManager::with_snapshots(snapshots.clone());
        restarted.rollback(&token).await.unwrap();
        assert!(snapshots.is_empty());
        assert_eq!(restarted.live_points(), 0);
    }

    #[tokio::test]
    async fn test_closed_transactions_are_dropped_from_ledger() {
        let manager = RollbackManager::new();
        let committed = Arc::new(InMemoryTransaction::new());
        let stale = manager.create("q", &env_with(&committed)).await.unwrap();
        committed.commit();

        let open = Arc::new(InMemoryTransaction::new());
        manager.create("q", &env_with(&open)).await.unwrap();
        assert_eq!(manager.live_points(), 1);
        // Only the open transaction is still referenced by the ledger
        assert_eq!(Arc::strong_count(&committed), 1);

        assert_eq!(
            manager.rollback(&stale).await,
            Err(RollbackError::TransactionClosed(stale.clone()))
        );
        assert_eq!(manager.release(&stale).await, Ok(()));
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_token_usable() {
        let snapshots = Arc::new(InMemorySnapshotService::new());
        let manager = RollbackManager::with_snapshots(snapshots.clone());
        let token = manager.create("q", &ExecutionEnv::default()).await.unwrap();

        // Pull the snapshot out from under the manager
        snapshots.discard(&token["pitr_".len()..]).await.unwrap();
        assert!(manager.rollback(&token).await.is_err());
        assert_eq!(manager.live_points(), 1);
    }
}
