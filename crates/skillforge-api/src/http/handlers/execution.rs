//! Execution control handlers for the REST API.

use std::collections::HashMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use skillforge_core::engine::StartRequest;
use skillforge_core::repository::execution::ExecutionFilter;
use skillforge_core::rollback::ExecutionEnv;
use skillforge_types::execution::{Execution, ExecutionState};

use crate::http::error::AppError;
use crate::http::extractors::query::ExecutionListQuery;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;

/// Body of `POST /api/v1/executions`.
#[derive(Debug, Deserialize)]
pub struct StartExecutionBody {
    /// Skill UUID or technical name.
    pub skill: String,
    pub trigger_text: Option<String>,
    #[serde(default)]
    pub input_data: HashMap<String, Value>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProvideInputBody {
    pub value: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    pub reason: Option<String>,
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse()
        .map_err(|_| AppError::Validation(format!("invalid execution id '{raw}'")))
}

fn to_json(execution: &Execution) -> Result<Value, AppError> {
    serde_json::to_value(execution).map_err(|e| AppError::Internal(e.to_string()))
}

fn execution_response(
    timer: RequestTimer,
    execution: &Execution,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let base = format!("/api/v1/executions/{}", execution.id);
    let mut resp = timer
        .respond(to_json(execution)?)
        .with_link("self", &base)
        .with_link("operations", &format!("{base}/operations"));
    if execution.state == ExecutionState::WaitingInput {
        resp = resp.with_link("input", &format!("{base}/input"));
    }
    Ok(Json(resp))
}

/// POST /api/v1/executions - Start an execution of a skill.
pub async fn start_execution(
    State(state): State<AppState>,
    Json(body): Json<StartExecutionBody>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();

    let mut env = match body.user_id {
        Some(user) => ExecutionEnv::for_user(user),
        None => ExecutionEnv::default(),
    };
    if let Some(session) = body.session_id {
        env = env.with_session(session);
    }

    let mut request = StartRequest::new(body.skill);
    request.input_data = body.input_data;
    if let Some(text) = body.trigger_text {
        request = request.with_trigger_text(text);
    }

    let execution = state.skill_service.start_execution(request, &env).await?;
    execution_response(timer, &execution)
}

/// GET /api/v1/executions - List executions, newest first.
pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionListQuery>,
) -> Result<Json<ApiResponse<Vec<Value>>>, AppError> {
    let timer = RequestTimer::start();

    let state_filter = match &query.state {
        Some(s) => Some(s.parse::<ExecutionState>().map_err(AppError::Validation)?),
        None => None,
    };
    let filter = ExecutionFilter {
        skill_name: query.skill,
        state: state_filter,
        user_id: query.user_id,
        include_children: query.include_children,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
    };

    let executions = state.skill_service.list_executions(&filter).await?;
    let items = executions
        .iter()
        .map(to_json)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(timer.respond(items).with_link("self", "/api/v1/executions")))
}

/// GET /api/v1/executions/{id} - Execution record with its pending prompt or error.
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state.skill_service.get_execution(parse_id(&id)?).await?;
    execution_response(timer, &execution)
}

/// GET /api/v1/executions/{id}/operations - Operation log in call order.
pub async fn list_operations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let id = parse_id(&id)?;
    let operations = state.skill_service.operations(id).await?;
    let data = serde_json::to_value(&operations).map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(
        timer
            .respond(data)
            .with_link("self", &format!("/api/v1/executions/{id}/operations"))
            .with_link("execution", &format!("/api/v1/executions/{id}")),
    ))
}

/// POST /api/v1/executions/{id}/input - Answer the pending prompt.
///
/// Returns the updated context alongside the new state.
pub async fn provide_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ProvideInputBody>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let id = parse_id(&id)?;

    let execution = state
        .skill_service
        .provide_input(id, body.value, &ExecutionEnv::default())
        .await?;

    let data = json!({
        "execution_id": execution.id,
        "state": execution.state,
        "context": execution.current_context,
        "pending_input": execution.pending_input,
        "error_message": execution.error_message,
    });
    Ok(Json(
        timer
            .respond(data)
            .with_link("execution", &format!("/api/v1/executions/{id}")),
    ))
}

/// POST /api/v1/executions/{id}/cancel - Cancel, with an optional `{"reason"}` body.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let id = parse_id(&id)?;

    let body: CancelBody = if body.is_empty() {
        CancelBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::Validation(e.to_string()))?
    };

    let execution = state.skill_service.cancel(id, body.reason).await?;
    execution_response(timer, &execution)
}

/// POST /api/v1/executions/{id}/rollback - Apply the execution's rollback token.
pub async fn rollback_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state.skill_service.rollback(parse_id(&id)?).await?;
    execution_response(timer, &execution)
}

/// POST /api/v1/executions/{id}/release - Drop the rollback point of a finished execution.
pub async fn release_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let execution = state.skill_service.release(parse_id(&id)?).await?;
    execution_response(timer, &execution)
}
