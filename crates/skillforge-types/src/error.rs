use thiserror::Error;

/// Errors from repository operations (used by trait definitions in skillforge-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Classification of a tool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// The tool name is not known to the invoker.
    NotFound,
    /// The caller is not allowed to run the tool.
    PermissionDenied,
    /// Parameters were rejected by the tool.
    InvalidParams,
    /// The tool ran and reported a failure.
    Execution,
    /// The call exceeded its time budget.
    Timeout,
}

/// Error returned by a tool invoker.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} error: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Execution, message)
    }

    pub fn not_found(tool: &str) -> Self {
        Self::new(ToolErrorKind::NotFound, format!("unknown tool '{tool}'"))
    }
}
