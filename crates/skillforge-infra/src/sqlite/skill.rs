//! SQLite skill repository implementation.
//!
//! Implements `SkillRepository` from `skillforge-core` using sqlx with split
//! read/write pools. Skill definitions are stored as JSON blobs; the lifecycle
//! state column is authoritative over the state inside the blob.

use chrono::{DateTime, Utc};
use skillforge_core::repository::skill::SkillRepository;
use skillforge_types::error::RepositoryError;
use skillforge_types::skill::{Skill, SkillId, SkillState, SkillStats};
use sqlx::Row;

use super::pool::DatabasePool;
use super::{format_datetime, is_foreign_key_violation, parse_datetime, query_err};

/// SQLite-backed implementation of `SkillRepository`.
pub struct SqliteSkillRepository {
    pool: DatabasePool,
}

impl SqliteSkillRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct SkillRow {
    state: String,
    definition: String,
}

impl SkillRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            state: row.try_get("state")?,
            definition: row.try_get("definition")?,
        })
    }

    fn into_skill(self) -> Result<Skill, RepositoryError> {
        let mut skill: Skill = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid skill definition JSON: {e}")))?;
        skill.state = self.state.parse().map_err(RepositoryError::Query)?;
        Ok(skill)
    }
}

fn stats_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SkillStats, RepositoryError> {
    let execution_count: i64 = row.try_get("execution_count").map_err(query_err)?;
    let success_count: i64 = row.try_get("success_count").map_err(query_err)?;
    let failure_count: i64 = row.try_get("failure_count").map_err(query_err)?;
    let avg_duration_ms: f64 = row.try_get("avg_duration_ms").map_err(query_err)?;
    let last_executed_at: Option<String> = row.try_get("last_executed_at").map_err(query_err)?;

    Ok(SkillStats {
        execution_count: execution_count.max(0) as u64,
        success_count: success_count.max(0) as u64,
        failure_count: failure_count.max(0) as u64,
        avg_duration_ms,
        last_executed_at: last_executed_at.as_deref().map(parse_datetime).transpose()?,
    })
}

const SELECT_SKILL: &str = "SELECT state, definition FROM skills";

// ---------------------------------------------------------------------------
// SkillRepository impl
// ---------------------------------------------------------------------------

impl SkillRepository for SqliteSkillRepository {
    async fn save_skill(&self, skill: &Skill) -> Result<(), RepositoryError> {
        let definition = serde_json::to_string(skill)
            .map_err(|e| RepositoryError::Query(format!("serialize skill: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO skills (id, technical_name, name, category, sequence, state, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(technical_name) DO UPDATE SET
                 id = excluded.id,
                 name = excluded.name,
                 category = excluded.category,
                 sequence = excluded.sequence,
                 state = excluded.state,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(skill.id.to_string())
        .bind(&skill.technical_name)
        .bind(&skill.name)
        .bind(&skill.category)
        .bind(skill.sequence)
        .bind(skill.state.to_string())
        .bind(&definition)
        .bind(format_datetime(&skill.created_at))
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_skill(&self, technical_name: &str) -> Result<Option<Skill>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_SKILL} WHERE technical_name = ?"))
            .bind(technical_name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| SkillRow::from_row(&row).map_err(query_err)?.into_skill())
            .transpose()
    }

    async fn get_skill_by_id(&self, id: &SkillId) -> Result<Option<Skill>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_SKILL} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| SkillRow::from_row(&row).map_err(query_err)?.into_skill())
            .transpose()
    }

    async fn list_skills(&self, state: Option<SkillState>) -> Result<Vec<Skill>, RepositoryError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "{SELECT_SKILL} WHERE state = ? ORDER BY sequence ASC, technical_name ASC"
                ))
                .bind(state.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_SKILL} ORDER BY sequence ASC, technical_name ASC"
                ))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        let mut skills = Vec::with_capacity(rows.len());
        for row in &rows {
            skills.push(SkillRow::from_row(row).map_err(query_err)?.into_skill()?);
        }
        Ok(skills)
    }

    async fn set_state(&self, technical_name: &str, state: SkillState) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE skills SET state = ?, updated_at = ? WHERE technical_name = ?")
            .bind(state.to_string())
            .bind(format_datetime(&Utc::now()))
            .bind(technical_name)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_skill(&self, technical_name: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM skills WHERE technical_name = ?")
            .bind(technical_name)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_outcome(
        &self,
        technical_name: &str,
        success: bool,
        duration_ms: u64,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        // Read-modify-write on the single writer connection
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT * FROM skill_stats WHERE technical_name = ?")
            .bind(technical_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;
        let mut stats = match row {
            Some(row) => stats_from_row(&row)?,
            None => SkillStats::default(),
        };
        stats.record(success, duration_ms, at);

        sqlx::query(
            r#"INSERT INTO skill_stats
               (technical_name, execution_count, success_count, failure_count, avg_duration_ms, last_executed_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(technical_name) DO UPDATE SET
                 execution_count = excluded.execution_count,
                 success_count = excluded.success_count,
                 failure_count = excluded.failure_count,
                 avg_duration_ms = excluded.avg_duration_ms,
                 last_executed_at = excluded.last_executed_at"#,
        )
        .bind(technical_name)
        .bind(stats.execution_count as i64)
        .bind(stats.success_count as i64)
        .bind(stats.failure_count as i64)
        .bind(stats.avg_duration_ms)
        .bind(stats.last_executed_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                RepositoryError::NotFound
            } else {
                query_err(e)
            }
        })?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn get_stats(&self, technical_name: &str) -> Result<SkillStats, RepositoryError> {
        let row = sqlx::query("SELECT * FROM skill_stats WHERE technical_name = ?")
            .bind(technical_name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => stats_from_row(&row),
            None => Ok(SkillStats::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::tests::test_pool;
    use skillforge_core::skill::definition::parse_skill_yaml;

    fn sample_skill(name: &str, sequence: i32) -> Skill {
        let mut skill = parse_skill_yaml(&format!(
            r#"
technical_name: {name}
name: Sample {name}
category: sales
sequence: {sequence}
trigger_phrases: ["run {name}"]
steps:
  - {{ id: one, name: One, type: tool_call, tool_name: util.echo }}
"#
        ))
        .unwrap();
        skill.state = SkillState::Active;
        skill
    }

    #[tokio::test]
    async fn test_save_and_get_skill() {
        let repo = SqliteSkillRepository::new(test_pool().await);
        let skill = sample_skill("create_quote", 10);
        repo.save_skill(&skill).await.unwrap();

        let loaded = repo.get_skill("create_quote").await.unwrap().unwrap();
        assert_eq!(loaded.id, skill.id);
        assert_eq!(loaded.name, "Sample create_quote");
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.state, SkillState::Active);

        let by_id = repo.get_skill_by_id(&skill.id).await.unwrap().unwrap();
        assert_eq!(by_id.technical_name, "create_quote");
        assert!(repo.get_skill("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_by_technical_name() {
        let repo = SqliteSkillRepository::new(test_pool().await);
        repo.save_skill(&sample_skill("create_quote", 10)).await.unwrap();
        let replacement = sample_skill("create_quote", 5);
        repo.save_skill(&replacement).await.unwrap();

        let all = repo.list_skills(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, replacement.id);
        assert_eq!(all[0].sequence, 5);
    }

    #[tokio::test]
    async fn test_list_orders_and_filters() {
        let repo = SqliteSkillRepository::new(test_pool().await);
        repo.save_skill(&sample_skill("zeta", 1)).await.unwrap();
        repo.save_skill(&sample_skill("beta", 20)).await.unwrap();
        repo.save_skill(&sample_skill("alpha", 20)).await.unwrap();
        repo.set_state("beta", SkillState::Deprecated).await.unwrap();

        let names: Vec<String> = repo
            .list_skills(None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.technical_name)
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "beta"]);

        let active = repo.list_skills(Some(SkillState::Active)).await.unwrap();
        assert_eq!(active.len(), 2);
        let deprecated = repo.get_skill("beta").await.unwrap().unwrap();
        assert_eq!(deprecated.state, SkillState::Deprecated);
    }

    #[tokio::test]
    async fn test_set_state_missing_is_not_found() {
        let repo = SqliteSkillRepository::new(test_pool().await);
        let err = repo.set_state("ghost", SkillState::Active).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_record_outcome_and_stats() {
        let repo = SqliteSkillRepository::new(test_pool().await);
        repo.save_skill(&sample_skill("create_quote", 10)).await.unwrap();
        assert_eq!(repo.get_stats("create_quote").await.unwrap(), SkillStats::default());

        let now = Utc::now();
        repo.record_outcome("create_quote", true, 100, now).await.unwrap();
        repo.record_outcome("create_quote", true, 300, now).await.unwrap();
        repo.record_outcome("create_quote", false, 50, now).await.unwrap();

        let stats = repo.get_stats("create_quote").await.unwrap();
        assert_eq!(stats.execution_count, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 1);
        assert!((stats.avg_duration_ms - 200.0).abs() < 1e-9);
        assert!(stats.last_executed_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_skill_removes_stats() {
        let repo = SqliteSkillRepository::new(test_pool().await);
        repo.save_skill(&sample_skill("create_quote", 10)).await.unwrap();
        repo.record_outcome("create_quote", true, 10, Utc::now()).await.unwrap();

        assert!(repo.delete_skill("create_quote").await.unwrap());
        assert!(!repo.delete_skill("create_quote").await.unwrap());
        assert_eq!(repo.get_stats("create_quote").await.unwrap().execution_count, 0);
    }
}
