//! Skill registry handlers for the REST API.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde_json::{Value, json};

use skillforge_core::skill::CompiledSkill;
use skillforge_types::skill::SkillState;

use crate::http::error::AppError;
use crate::http::extractors::query::SkillListQuery;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

fn skill_response(
    timer: RequestTimer,
    skill: &CompiledSkill,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let data = serde_json::to_value(skill.skill()).map_err(|e| AppError::Internal(e.to_string()))?;
    let base = format!("/api/v1/skills/{}", skill.technical_name());
    Ok(Json(
        timer
            .respond(data)
            .with_link("self", &base)
            .with_link("stats", &format!("{base}/stats")),
    ))
}

/// GET /api/v1/skills - List registered skills, optionally by state.
pub async fn list_skills(
    State(state): State<AppState>,
    Query(query): Query<SkillListQuery>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();

    let state_filter = match &query.state {
        Some(s) => Some(s.parse::<SkillState>().map_err(AppError::Validation)?),
        None => None,
    };
    let skills = state.skill_service.list_skills(state_filter).await?;
    let data = serde_json::to_value(&skills).map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(timer.respond(data).with_link("self", "/api/v1/skills")))
}

/// POST /api/v1/skills - Register a skill from a YAML (or JSON) body.
///
/// Re-registering a technical name replaces the stored definition.
pub async fn register_skill(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    if body.trim().is_empty() {
        return Err(AppError::Validation("request body must contain a skill definition".into()));
    }
    let skill = state.skill_service.register_yaml(&body).await?;
    tracing::info!(skill = skill.technical_name(), "skill registered over http");
    skill_response(timer, &skill)
}

/// GET /api/v1/skills/{name} - One skill by technical name or UUID.
pub async fn get_skill(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let skill = state.skill_service.get_skill(&name).await?;
    skill_response(timer, &skill)
}

/// DELETE /api/v1/skills/{name} - Remove a skill no other skill references.
pub async fn remove_skill(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let removed = state.skill_service.remove_skill(&name).await?;
    Ok(Json(timer.respond(json!({ "technical_name": name, "removed": removed }))))
}

/// POST /api/v1/skills/{name}/activate - Make a skill executable and matchable.
pub async fn activate_skill(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let skill = state.skill_service.activate(&name).await?;
    skill_response(timer, &skill)
}

/// POST /api/v1/skills/{name}/deprecate - Withdraw a skill from intent matching.
pub async fn deprecate_skill(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let skill = state.skill_service.deprecate(&name).await?;
    skill_response(timer, &skill)
}

/// GET /api/v1/skills/{name}/stats - Execution counts and mean duration.
pub async fn skill_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();
    let stats = state.skill_service.skill_stats(&name).await?;
    let data = json!({
        "technical_name": name,
        "execution_count": stats.execution_count,
        "success_count": stats.success_count,
        "failure_count": stats.failure_count,
        "success_rate": stats.success_rate(),
        "avg_duration_ms": stats.avg_duration_ms,
        "last_executed_at": stats.last_executed_at,
    });
    Ok(Json(
        timer
            .respond(data)
            .with_link("skill", &format!("/api/v1/skills/{name}")),
    ))
}
