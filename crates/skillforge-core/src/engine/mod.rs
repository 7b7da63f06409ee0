//! Execution engine: state machine, step interpreter and durable checkpointing.
//!
//! - `expression` -- allowlisted expression compiler and evaluator
//! - `context` -- the per-execution context store and `{var}` templates
//! - `lifecycle` -- pure state-machine transitions over `Execution`
//! - `retry` -- fixed-delay retry policy of operation steps
//! - `checkpoint` -- persistence of execution records and the operation log
//! - `tool` -- tool invoker / step resolver ports and the namespace router
//! - `step_runner` -- dispatch of the individual step types
//! - `executor` -- the drive loop, suspension, subskills, cancel and rollback

pub mod checkpoint;
pub mod context;
pub mod executor;
pub mod expression;
pub mod lifecycle;
pub mod retry;
pub mod step_runner;
pub mod tool;

pub use context::ContextStore;
pub use executor::{EngineError, ExecutionEngine, StartRequest};
pub use step_runner::{StepError, StepErrorKind};
pub use tool::{BuiltinTools, StepResolver, ToolInvoker, ToolRouter};
