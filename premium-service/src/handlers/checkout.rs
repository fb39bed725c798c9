//! Checkout: starting a charge and handling the PayPal approval redirects.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use validator::Validate;

use crate::{
    dtos::{CaptureRequest, CheckoutRequest, CheckoutResponse, PaypalReturnQuery},
    middleware::UserContext,
    services::CaptureResult,
    startup::AppState,
};

/// Start a premium purchase with the chosen provider.
pub async fn create_checkout(
    State(state): State<AppState>,
    user: UserContext,
    Json(payload): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), AppError> {
    payload.validate()?;

    tracing::info!(
        user_id = %user.user_id,
        plan = %payload.plan,
        provider = %payload.provider,
        "Starting checkout"
    );

    let started = state
        .service
        .initiate_charge(
            &user.user_id,
            payload.plan,
            payload.provider,
            payload.phone_number,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(CheckoutResponse::from(started))))
}

/// Capture an approved PayPal order on behalf of the client.
pub async fn capture_paypal(
    State(state): State<AppState>,
    user: UserContext,
    Json(payload): Json<CaptureRequest>,
) -> Result<Json<CaptureResult>, AppError> {
    payload.validate()?;

    let result = state
        .service
        .handle_capture_return(&user.user_id, &payload.order_id)
        .await?;
    Ok(Json(result))
}

/// PayPal redirects the payer here after approval (`?token=<order id>`).
pub async fn paypal_return(
    State(state): State<AppState>,
    user: UserContext,
    Query(query): Query<PaypalReturnQuery>,
) -> Result<Json<CaptureResult>, AppError> {
    tracing::info!(
        user_id = %user.user_id,
        order_id = %query.token,
        payer_id = ?query.payer_id,
        "Payer returned from PayPal"
    );

    let result = state
        .service
        .handle_capture_return(&user.user_id, &query.token)
        .await?;
    Ok(Json(result))
}

pub async fn paypal_cancel(
    State(state): State<AppState>,
    user: UserContext,
    Query(query): Query<PaypalReturnQuery>,
) -> Result<Json<CaptureResult>, AppError> {
    let result = state
        .service
        .handle_cancel_return(&user.user_id, &query.token)
        .await?;
    Ok(Json(result))
}
