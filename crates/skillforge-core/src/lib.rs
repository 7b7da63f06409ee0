//! Business logic and port definitions for Skillforge.
//!
//! This crate defines the "ports" (repository traits, tool invoker, snapshot
//! service, transaction handle) that the infrastructure layer implements,
//! plus the skill registry, intent matcher, rollback manager and execution
//! engine built on top of them. It depends only on `skillforge-types` --
//! never on `skillforge-infra` or any database/IO crate.

pub mod engine;
pub mod event;
pub mod repository;
pub mod rollback;
pub mod service;
pub mod skill;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
