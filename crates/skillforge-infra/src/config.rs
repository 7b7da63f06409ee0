//! Configuration loader for Skillforge.
//!
//! Reads `config.toml` from the data directory (`~/.skillforge/` in
//! production) and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use skillforge_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "SKILLFORGE_DATA_DIR";

const SNAPSHOT_DIR: &str = "snapshots";

/// Root directory for databases, snapshots and `config.toml`.
///
/// `SKILLFORGE_DATA_DIR` wins; otherwise `~/.skillforge`, or `./.skillforge`
/// when no home directory can be determined.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".skillforge")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Where snapshot files go: the configured directory, else `{data_dir}/snapshots`.
pub fn snapshot_dir(config: &EngineConfig, data_dir: &Path) -> PathBuf {
    config
        .snapshot
        .directory
        .clone()
        .unwrap_or_else(|| data_dir.join(SNAPSHOT_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.match_limit, 5);
        assert!(!config.snapshot.enabled);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
match_threshold = 0.6
max_subskill_depth = 2

[snapshot]
enabled = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert!((config.match_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.max_subskill_depth, 2);
        assert_eq!(config.default_timeout_secs, 1800);
        assert!(config.snapshot.enabled);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert!((config.match_threshold - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_dir_defaults_under_data_dir() {
        let mut config = EngineConfig::default();
        let base = Path::new("/srv/skillforge");
        assert_eq!(snapshot_dir(&config, base), base.join("snapshots"));

        config.snapshot.directory = Some(PathBuf::from("/mnt/pitr"));
        assert_eq!(snapshot_dir(&config, base), PathBuf::from("/mnt/pitr"));
    }
}
