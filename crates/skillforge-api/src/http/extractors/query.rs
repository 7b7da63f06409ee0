//! Query parameter extractors for list endpoints.

use serde::Deserialize;

/// Query parameters for the execution list endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct ExecutionListQuery {
    /// Filter by skill technical name.
    pub skill: Option<String>,
    /// Filter by state (pending, running, waiting_input, completed, ...).
    pub state: Option<String>,
    pub user_id: Option<String>,
    /// Include subskill executions.
    #[serde(default)]
    pub include_children: bool,
    /// Maximum results (default 50).
    pub limit: Option<u32>,
}

/// Query parameters for the skill list endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct SkillListQuery {
    /// Filter by state (draft, active, deprecated).
    pub state: Option<String>,
}
