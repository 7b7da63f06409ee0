//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes intent
//! matching, execution bounds and the snapshot rollback tier.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the skill engine.
///
/// Loaded from `~/.skillforge/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum Jaccard score for an intent match to be returned.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,

    /// Maximum number of intent matches returned.
    #[serde(default = "default_match_limit")]
    pub match_limit: usize,

    /// Wall-clock budget of an execution when its skill sets none.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Upper bound on items iterated by a single loop step.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,

    /// Maximum nesting of subskill executions.
    #[serde(default = "default_max_subskill_depth")]
    pub max_subskill_depth: u32,

    /// Upper bound on step dispatches per drive of an execution.
    #[serde(default = "default_max_dispatch_steps")]
    pub max_dispatch_steps: usize,

    /// Release the rollback point as soon as an execution completes.
    /// Completed executions then cannot be rolled back; failed ones still can.
    #[serde(default)]
    pub release_on_complete: bool,

    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

fn default_match_threshold() -> f64 {
    0.3
}

fn default_match_limit() -> usize {
    5
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_max_loop_iterations() -> usize {
    1000
}

fn default_max_subskill_depth() -> u32 {
    5
}

fn default_max_dispatch_steps() -> usize {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            match_limit: default_match_limit(),
            default_timeout_secs: default_timeout_secs(),
            max_loop_iterations: default_max_loop_iterations(),
            max_subskill_depth: default_max_subskill_depth(),
            max_dispatch_steps: default_max_dispatch_steps(),
            release_on_complete: false,
            snapshot: SnapshotConfig::default(),
        }
    }
}

/// Snapshot (point-in-time recovery) tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// When false, rollback points always use savepoints.
    #[serde(default)]
    pub enabled: bool,
    /// Where snapshot files are written (defaults to `{data_dir}/snapshots`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert!((config.match_threshold - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.match_limit, 5);
        assert_eq!(config.default_timeout_secs, 1800);
        assert_eq!(config.max_loop_iterations, 1000);
        assert_eq!(config.max_subskill_depth, 5);
        assert_eq!(config.max_dispatch_steps, 10_000);
        assert!(!config.release_on_complete);
        assert!(!config.snapshot.enabled);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.match_limit, 5);
        assert!(config.snapshot.directory.is_none());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
match_threshold = 0.5
max_loop_iterations = 10
release_on_complete = true

[snapshot]
enabled = true
directory = "/var/lib/skillforge/snapshots"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert!((config.match_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.max_loop_iterations, 10);
        assert_eq!(config.default_timeout_secs, 1800);
        assert!(config.release_on_complete);
        assert!(config.snapshot.enabled);
        assert_eq!(
            config.snapshot.directory.as_deref(),
            Some(std::path::Path::new("/var/lib/skillforge/snapshots"))
        );
    }
}
