//! Shared domain types for Skillforge.
//!
//! This crate contains the core domain types used across the workspace:
//! Skill, StepDefinition, Execution, the operation log, engine configuration,
//! lifecycle events, and the error types shared by repository traits.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod skill;
