//! REST API route handlers.

pub mod execution;
pub mod intent;
pub mod skill;
