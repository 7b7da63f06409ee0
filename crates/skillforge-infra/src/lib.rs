//! Infrastructure layer for SkillForge.
//!
//! Implements the repository and rollback traits defined in `skillforge-core`
//! on SQLite, plus data-directory and `config.toml` resolution.

pub mod config;
pub mod sqlite;
