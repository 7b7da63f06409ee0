//! Intent matching handler.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;

use skillforge_core::skill::{IntentMatch, MatchContext};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MatchIntentBody {
    pub text: String,
    /// Restrict candidates to one skill category.
    pub category: Option<String>,
    pub threshold: Option<f64>,
    pub limit: Option<usize>,
}

/// POST /api/v1/intents/match - Rank active skills against free text.
pub async fn match_intent(
    State(state): State<AppState>,
    Json(body): Json<MatchIntentBody>,
) -> Result<Json<ApiResponse<Vec<IntentMatch>>>, AppError> {
    let timer = RequestTimer::start();

    if let Some(threshold) = body.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(AppError::Validation(format!(
                "threshold must be between 0 and 1, got {threshold}"
            )));
        }
    }

    let context = MatchContext {
        category: body.category,
    };
    let matches = state
        .skill_service
        .match_intent(&body.text, Some(&context), body.threshold, body.limit)
        .await?;

    Ok(Json(timer.respond(matches).with_link("skills", "/api/v1/skills")))
}
