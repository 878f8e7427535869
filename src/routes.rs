use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;

use crate::middleware::{require_api_key, AdminApiKey};
use crate::openapi::swagger_ui;
use crate::quota::handlers as quota_handlers;
use crate::scheduler::handlers as scheduler_handlers;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Prometheus scrape endpoint
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Quota and selection routes used by the app
fn quota_routes() -> Router<AppState> {
    Router::new()
        .route("/quotas/{user_id}", get(quota_handlers::get_quota))
        .route(
            "/quotas/{user_id}/consume",
            post(quota_handlers::consume_quota),
        )
        .route(
            "/users/{user_id}/selections",
            get(quota_handlers::list_selections).post(quota_handlers::create_selection),
        )
        .route(
            "/scheduler/status",
            get(scheduler_handlers::scheduler_status),
        )
}

/// Administrative routes (protected by API key auth)
fn admin_routes(api_key: Option<String>) -> Router<AppState> {
    Router::new()
        .route("/quotas/{user_id}/reset", post(quota_handlers::reset_quota))
        .route("/scheduler/run", post(scheduler_handlers::run_reset_pass))
        .layer(middleware::from_fn(require_api_key))
        .layer(Extension(AdminApiKey(api_key)))
}

/// Build all API v1 routes
pub fn api_v1_routes(admin_api_key: Option<String>) -> Router<AppState> {
    Router::new()
        .merge(quota_routes())
        .merge(admin_routes(admin_api_key))
}

/// Build the complete application router
pub fn build_router(state: &AppState) -> Router<AppState> {
    let admin_api_key = state.config.admin_api_key.clone();
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api_v1_routes(admin_api_key))
        .merge(swagger_ui())
}
