//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use skillforge_core::engine::executor::EngineError;
use skillforge_core::rollback::RollbackError;
use skillforge_core::skill::definition::SkillError;
use skillforge_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Skill definition and registry errors.
    Skill(SkillError),
    /// Execution control errors.
    Engine(EngineError),
    /// Malformed request.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<SkillError> for AppError {
    fn from(e: SkillError) -> Self {
        AppError::Skill(e)
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Skill(e) => skill_status(e),
            AppError::Engine(e) => match e {
                EngineError::ExecutionNotFound(_) => (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND"),
                EngineError::Transition(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
                EngineError::SkillNotExecutable { .. } => {
                    (StatusCode::CONFLICT, "SKILL_NOT_EXECUTABLE")
                }
                EngineError::MissingParameter(_) | EngineError::InvalidInput(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                EngineError::Busy(_) => (StatusCode::CONFLICT, "EXECUTION_BUSY"),
                EngineError::Timeout { .. } => (StatusCode::CONFLICT, "EXECUTION_TIMEOUT"),
                EngineError::Rollback(e) => rollback_status(e),
                EngineError::Skill(e) => skill_status(e),
                EngineError::Context(_) => (StatusCode::BAD_REQUEST, "CONTEXT_ERROR"),
                EngineError::Checkpoint(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "CHECKPOINT_ERROR")
                }
            },
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Skill(e) => e.to_string(),
            AppError::Engine(e) => e.to_string(),
            AppError::Validation(msg) | AppError::Internal(msg) => msg.clone(),
        }
    }
}

fn skill_status(e: &SkillError) -> (StatusCode, &'static str) {
    match e {
        SkillError::NotFound(_) | SkillError::Repository(RepositoryError::NotFound) => {
            (StatusCode::NOT_FOUND, "SKILL_NOT_FOUND")
        }
        SkillError::ParseError(_) | SkillError::ValidationError(_) | SkillError::CycleDetected(_) => {
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
        }
        SkillError::Repository(RepositoryError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "SKILL_ERROR"),
    }
}

fn rollback_status(e: &RollbackError) -> (StatusCode, &'static str) {
    match e {
        RollbackError::UnknownToken(_) => (StatusCode::NOT_FOUND, "ROLLBACK_TOKEN_NOT_FOUND"),
        RollbackError::Unavailable
        | RollbackError::NothingToRollBack
        | RollbackError::AlreadyConsumed(_)
        | RollbackError::TransactionClosed(_) => (StatusCode::CONFLICT, "ROLLBACK_UNAVAILABLE"),
        RollbackError::Snapshot(_) | RollbackError::Savepoint(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "ROLLBACK_FAILED")
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.message();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }

        let body = serde_json::to_string(&ApiResponse::error(code, &message)).unwrap_or_else(|_| {
            r#"{"errors":[{"code":"SERIALIZATION_ERROR","message":"Failed to serialize response"}]}"#.to_string()
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}
