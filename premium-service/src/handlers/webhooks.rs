//! Provider push endpoints.
//!
//! These routes bypass request signing; each adapter authenticates its own
//! callbacks. Bodies are passed through untouched so signatures can be
//! verified over the exact bytes received.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;
use std::collections::HashMap;

use crate::{
    dtos::MpesaAck,
    models::Provider,
    providers::InboundCallback,
    services::Ack,
    startup::AppState,
};

pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let ack = state
        .service
        .handle_provider_callback(Provider::Paypal, InboundCallback { headers, query, body })
        .await;

    match ack {
        Ack::Accepted => StatusCode::OK.into_response(),
        Ack::Rejected => {
            AppError::Unauthorized(anyhow::anyhow!("Invalid webhook signature")).into_response()
        }
    }
}

pub async fn mpesa_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let ack = state
        .service
        .handle_provider_callback(Provider::Mpesa, InboundCallback { headers, query, body })
        .await;

    match ack {
        Ack::Accepted => (
            StatusCode::OK,
            Json(MpesaAck {
                result_code: 0,
                result_desc: "Accepted",
            }),
        )
            .into_response(),
        Ack::Rejected => (
            StatusCode::UNAUTHORIZED,
            Json(MpesaAck {
                result_code: 1,
                result_desc: "Rejected",
            }),
        )
            .into_response(),
    }
}
