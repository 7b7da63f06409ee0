//! SQLite storage layer.
//!
//! Two databases live under the data directory:
//!
//! - `skillforge.db` holds engine state (skills, stats, executions, the
//!   operation log) behind split read/write pools with migrations.
//! - `workspace.db` holds business data. SQL tools, workspace transactions
//!   and file snapshots operate on it, so a business rollback never rewinds
//!   engine history.

pub mod execution;
pub mod pool;
pub mod skill;
pub mod snapshot;
pub mod tool;
pub mod transaction;

pub use execution::SqliteExecutionRepository;
pub use pool::{DatabasePool, open_workspace};
pub use skill::SqliteSkillRepository;
pub use snapshot::SqliteSnapshotService;
pub use tool::SqlToolInvoker;
pub use transaction::SqliteTransactionHandle;

use chrono::{DateTime, SecondsFormat, Utc};
use skillforge_types::error::RepositoryError;
use uuid::Uuid;

pub(crate) fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width so that text ordering matches time ordering.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub(crate) fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_datetime_roundtrip_is_fixed_width() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let later = early + chrono::Duration::microseconds(1_500);
        let (a, b) = (format_datetime(&early), format_datetime(&later));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b).unwrap(), later);
    }

    #[test]
    fn test_parse_errors_are_query_errors() {
        assert!(matches!(parse_uuid("nope"), Err(RepositoryError::Query(_))));
        assert!(matches!(
            parse_datetime("yesterday"),
            Err(RepositoryError::Query(_))
        ));
    }
}
