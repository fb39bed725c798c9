use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{AttemptId, AttemptState, PaymentAttempt, Plan, Provider, UserEntitlement};
use crate::providers::UserFacingAction;
use crate::services::ChargeStarted;

pub const DEFAULT_HISTORY_LIMIT: i64 = 20;
pub const MAX_HISTORY_LIMIT: i64 = 100;

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutRequest {
    pub plan: Plan,
    pub provider: Provider,
    /// Required for M-Pesa.
    #[validate(length(min = 9, max = 20))]
    pub phone_number: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub attempt_id: AttemptId,
    pub provider: Provider,
    pub provider_reference: String,
    pub amount: String,
    pub currency: String,
    pub action: UserFacingAction,
}

impl From<ChargeStarted> for CheckoutResponse {
    fn from(started: ChargeStarted) -> Self {
        Self {
            attempt_id: started.attempt_id,
            provider: started.provider,
            provider_reference: started.provider_reference,
            amount: started.amount.to_decimal_string(),
            currency: started.amount.currency,
            action: started.action,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CaptureRequest {
    #[validate(length(min = 1, max = 64))]
    pub order_id: String,
}

/// Query PayPal appends to the return and cancel URLs.
#[derive(Debug, Deserialize)]
pub struct PaypalReturnQuery {
    pub token: String,
    #[serde(rename = "PayerID")]
    pub payer_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AttemptResponse {
    pub attempt_id: AttemptId,
    pub plan: Plan,
    pub provider: Provider,
    pub amount: String,
    pub currency: String,
    pub state: AttemptState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PaymentAttempt> for AttemptResponse {
    fn from(attempt: PaymentAttempt) -> Self {
        Self {
            attempt_id: attempt.id,
            plan: attempt.plan,
            provider: attempt.provider,
            amount: attempt.amount.to_decimal_string(),
            currency: attempt.amount.currency,
            state: attempt.state,
            failure_reason: attempt.failure_reason,
            provider_reference: attempt.provider_reference,
            created_at: attempt.created_at,
            updated_at: attempt.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PremiumStatusResponse {
    pub is_premium: bool,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<UserEntitlement> for PremiumStatusResponse {
    fn from(entitlement: UserEntitlement) -> Self {
        Self {
            active: entitlement.is_active_at(Utc::now()),
            is_premium: entitlement.is_premium,
            expires_at: entitlement.premium_expires_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

impl HistoryQuery {
    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub payments: Vec<AttemptResponse>,
}

/// Acknowledgement body Daraja expects from a callback receiver.
#[derive(Debug, Serialize)]
pub struct MpesaAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: &'static str,
}
