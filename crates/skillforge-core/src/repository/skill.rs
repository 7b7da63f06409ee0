//! Skill repository trait definition.
//!
//! Stores skill definitions keyed by technical name, their lifecycle state,
//! and aggregated execution statistics.

use chrono::{DateTime, Utc};
use skillforge_types::error::RepositoryError;
use skillforge_types::skill::{Skill, SkillId, SkillState, SkillStats};

/// Repository trait for skill persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait SkillRepository: Send + Sync {
    /// Upsert a skill (insert or replace by technical name).
    fn save_skill(
        &self,
        skill: &Skill,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a skill by technical name.
    fn get_skill(
        &self,
        technical_name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Skill>, RepositoryError>> + Send;

    /// Get a skill by its UUID.
    fn get_skill_by_id(
        &self,
        id: &SkillId,
    ) -> impl std::future::Future<Output = Result<Option<Skill>, RepositoryError>> + Send;

    /// List skills ordered by sequence then technical name, optionally
    /// filtered by state.
    fn list_skills(
        &self,
        state: Option<SkillState>,
    ) -> impl std::future::Future<Output = Result<Vec<Skill>, RepositoryError>> + Send;

    /// Change a skill's lifecycle state. `NotFound` if it does not exist.
    fn set_state(
        &self,
        technical_name: &str,
        state: SkillState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a skill by technical name. Returns `true` if it existed.
    fn delete_skill(
        &self,
        technical_name: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Fold one execution outcome into the skill's statistics.
    fn record_outcome(
        &self,
        technical_name: &str,
        success: bool,
        duration_ms: u64,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Statistics for a skill (zeroed if it never ran).
    fn get_stats(
        &self,
        technical_name: &str,
    ) -> impl std::future::Future<Output = Result<SkillStats, RepositoryError>> + Send;
}
