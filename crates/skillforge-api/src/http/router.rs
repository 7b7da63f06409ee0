//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Skills
        .route(
            "/skills",
            get(handlers::skill::list_skills).post(handlers::skill::register_skill),
        )
        .route(
            "/skills/{name}",
            get(handlers::skill::get_skill).delete(handlers::skill::remove_skill),
        )
        .route(
            "/skills/{name}/activate",
            post(handlers::skill::activate_skill),
        )
        .route(
            "/skills/{name}/deprecate",
            post(handlers::skill::deprecate_skill),
        )
        .route("/skills/{name}/stats", get(handlers::skill::skill_stats))
        // Intent matching
        .route("/intents/match", post(handlers::intent::match_intent))
        // Executions
        .route(
            "/executions",
            get(handlers::execution::list_executions).post(handlers::execution::start_execution),
        )
        .route("/executions/{id}", get(handlers::execution::get_execution))
        .route(
            "/executions/{id}/operations",
            get(handlers::execution::list_operations),
        )
        .route(
            "/executions/{id}/input",
            post(handlers::execution::provide_input),
        )
        .route(
            "/executions/{id}/cancel",
            post(handlers::execution::cancel_execution),
        )
        .route(
            "/executions/{id}/rollback",
            post(handlers::execution::rollback_execution),
        )
        .route(
            "/executions/{id}/release",
            post(handlers::execution::release_execution),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
