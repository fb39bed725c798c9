use axum::{
    extract::{Path, Query, State},
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::{AttemptResponse, HistoryQuery, HistoryResponse, PremiumStatusResponse},
    middleware::UserContext,
    models::AttemptId,
    services::PremiumError,
    startup::AppState,
};

/// Poll the provider for one of the caller's attempts and return its state.
pub async fn payment_status(
    State(state): State<AppState>,
    user: UserContext,
    Path(attempt_id): Path<AttemptId>,
) -> Result<Json<AttemptResponse>, AppError> {
    // Attempts of other users are reported as missing.
    match state.service.find_attempt(attempt_id).await? {
        Some(attempt) if attempt.user_id == user.user_id => {}
        _ => return Err(PremiumError::AttemptNotFound.into()),
    }

    let attempt = state.service.poll_and_reconcile_once(attempt_id).await?;
    Ok(Json(AttemptResponse::from(attempt)))
}

pub async fn premium_status(
    State(state): State<AppState>,
    user: UserContext,
) -> Result<Json<PremiumStatusResponse>, AppError> {
    let entitlement = state.service.entitlement(&user.user_id).await?;
    Ok(Json(PremiumStatusResponse::from(entitlement)))
}

pub async fn payment_history(
    State(state): State<AppState>,
    user: UserContext,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let payments = state
        .service
        .payment_history(&user.user_id, query.limit())
        .await?
        .into_iter()
        .map(AttemptResponse::from)
        .collect();

    Ok(Json(HistoryResponse { payments }))
}
