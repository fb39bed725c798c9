//! HTTP handlers for premium-service.

pub mod checkout;
pub mod status;
pub mod webhooks;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::services::get_metrics;
use crate::startup::AppState;

pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "premium-service" })),
    )
}

pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.service.configured_providers();
    (
        StatusCode::OK,
        Json(json!({ "status": "ready", "providers": providers })),
    )
}

pub async fn metrics() -> impl IntoResponse {
    get_metrics()
}
