//! Safaricom Daraja (M-Pesa Express / STK push) adapter.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Duration, Utc};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::utils::signature::constant_time_eq;
use std::collections::BTreeMap;

use super::{
    excerpt, send_with_token, status_error, AccessToken, ChargeInitiated, ChargeRequest,
    InboundCallback, PaymentProvider, ProviderError, TokenCache, UserFacingAction,
};
use crate::config::MpesaConfig;
use crate::models::{Money, Outcome, Provider};

const DEFAULT_TOKEN_LIFETIME_SECONDS: i64 = 3_600;
const RESULT_CANCELLED_BY_USER: i64 = 1032;
const ERROR_STILL_PROCESSING: &str = "500.001.1001";

pub struct MpesaProvider {
    client: reqwest::Client,
    config: MpesaConfig,
    tokens: TokenCache,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: i64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: String,
    account_reference: String,
    transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct StkQueryRequest<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkQueryResponse {
    #[serde(rename = "ResultCode")]
    result_code: Option<Value>,
    #[serde(rename = "ResultDesc")]
    result_desc: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DarajaError {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(rename = "Body")]
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    result_code: Value,
    #[serde(rename = "ResultDesc")]
    result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata")]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
struct CallbackItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: Option<Value>,
}

/// Daraja encodes numbers either as JSON numbers or as strings.
fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `254XXXXXXXXX` form expected by Daraja.
pub fn normalize_phone(raw: &str) -> Result<String, ProviderError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else if digits.starts_with("254") {
        digits
    } else {
        format!("254{}", digits)
    };

    if normalized.len() != 12 {
        return Err(ProviderError::InvalidRequest(format!(
            "phone number {} is not a valid Kenyan mobile number",
            raw
        )));
    }
    Ok(normalized)
}

/// Daraja timestamps are East Africa Time.
fn daraja_timestamp() -> String {
    (Utc::now() + Duration::hours(3))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

impl MpesaProvider {
    pub fn new(client: reqwest::Client, config: MpesaConfig) -> Self {
        Self {
            client,
            config,
            tokens: TokenCache::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    fn credentials(&self) -> (String, String) {
        let timestamp = daraja_timestamp();
        let password = stk_password(
            &self.config.shortcode,
            self.config.passkey.expose_secret(),
            &timestamp,
        );
        (password, timestamp)
    }

    async fn fetch_token(&self) -> Result<AccessToken, ProviderError> {
        let response = self
            .client
            .get(self.url("/oauth/v1/generate"))
            .query(&[("grant_type", "client_credentials")])
            .basic_auth(
                &self.config.consumer_key,
                Some(self.config.consumer_secret.expose_secret()),
            )
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            tracing::error!(status = %status, body = %excerpt(&body), "M-Pesa token exchange failed");
            return Err(ProviderError::Unavailable(format!(
                "M-Pesa token exchange failed with HTTP {}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::Unavailable(format!("unreadable M-Pesa token response: {}", e))
        })?;
        let lifetime = token
            .expires_in
            .as_ref()
            .and_then(lenient_i64)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECONDS);

        Ok(AccessToken::new(token.access_token, lifetime))
    }

    async fn send<B>(&self, build: B) -> Result<(StatusCode, String), ProviderError>
    where
        B: Fn(&str) -> reqwest::RequestBuilder,
    {
        let response =
            send_with_token(Provider::Mpesa, &self.tokens, || self.fetch_token(), build).await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    fn callback_url(&self) -> String {
        format!(
            "{}?token={}",
            self.config.callback_url,
            urlencoding::encode(self.config.callback_secret.expose_secret())
        )
    }

    fn authenticate(&self, callback: &InboundCallback) -> Result<(), ProviderError> {
        let expected = self.config.callback_secret.expose_secret();
        if expected.is_empty() {
            return Err(ProviderError::InvalidCallback(
                "M-Pesa callback secret is not configured".to_string(),
            ));
        }

        let provided = callback
            .query
            .get("token")
            .ok_or_else(|| ProviderError::InvalidCallback("missing callback token".to_string()))?;

        if !constant_time_eq(expected, provided) {
            return Err(ProviderError::InvalidCallback(
                "callback token mismatch".to_string(),
            ));
        }
        Ok(())
    }

    fn callback_outcome(&self, callback: StkCallback) -> Result<Outcome, ProviderError> {
        let reference = callback.checkout_request_id;
        let code = lenient_i64(&callback.result_code).ok_or_else(|| {
            ProviderError::InvalidCallback(format!(
                "unreadable ResultCode {}",
                callback.result_code
            ))
        })?;

        if code != 0 {
            tracing::info!(
                checkout_request_id = %reference,
                result_code = code,
                result_desc = ?callback.result_desc,
                "M-Pesa payment not completed"
            );
            return Ok(failure_for_code(reference, code));
        }

        let items: BTreeMap<String, Value> = callback
            .callback_metadata
            .map(|m| m.items)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| item.value.map(|v| (item.name, v)))
            .collect();

        let amount_confirmed = items
            .get("Amount")
            .map(|v| Money::parse(&value_to_string(v), &self.config.currency))
            .transpose()
            .map_err(|e| ProviderError::InvalidCallback(format!("unreadable Amount: {}", e)))?;

        let mut metadata = BTreeMap::new();
        if let Some(phone) = items.get("PhoneNumber") {
            metadata.insert("phone_number".to_string(), value_to_string(phone));
        }
        if let Some(date) = items.get("TransactionDate") {
            metadata.insert("transaction_date".to_string(), value_to_string(date));
        }
        if let Some(merchant) = callback.merchant_request_id {
            metadata.insert("merchant_request_id".to_string(), merchant);
        }

        Ok(Outcome::Success {
            provider_reference: reference,
            receipt_id: items.get("MpesaReceiptNumber").map(value_to_string),
            amount_confirmed,
            metadata,
        })
    }
}

fn failure_for_code(reference: String, code: i64) -> Outcome {
    if code == RESULT_CANCELLED_BY_USER {
        Outcome::Failure {
            provider_reference: reference,
            reason_code: "CANCELLED_BY_USER".to_string(),
            cancelled_by_payer: true,
        }
    } else {
        Outcome::failure(reference, format!("MPESA_RESULT_{}", code))
    }
}

#[async_trait]
impl PaymentProvider for MpesaProvider {
    fn provider(&self) -> Provider {
        Provider::Mpesa
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn create_charge(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeInitiated, ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured(Provider::Mpesa));
        }

        let phone = request
            .phone_number
            .as_deref()
            .ok_or_else(|| ProviderError::InvalidRequest("phone number is required".to_string()))
            .and_then(normalize_phone)?;
        let amount = request
            .amount
            .whole_units()
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;

        let (password, timestamp) = self.credentials();
        let payload = StkPushRequest {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount,
            party_a: &phone,
            party_b: &self.config.shortcode,
            phone_number: &phone,
            callback_url: self.callback_url(),
            account_reference: request.attempt_id.to_string(),
            transaction_desc: &self.config.transaction_desc,
        };

        let url = self.url("/mpesa/stkpush/v1/processrequest");
        let (status, body) = self
            .send(|token| self.client.post(&url).bearer_auth(token).json(&payload))
            .await?;

        if !status.is_success() {
            tracing::error!(
                attempt_id = %request.attempt_id,
                status = %status,
                body = %excerpt(&body),
                "M-Pesa STK push failed"
            );
            return Err(status_error(status, &body));
        }

        let push: StkPushResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::Unavailable(format!("unreadable STK push response: {}", e))
        })?;
        if push.response_code != "0" {
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message: push
                    .response_description
                    .unwrap_or_else(|| format!("ResponseCode {}", push.response_code)),
            });
        }

        tracing::info!(
            attempt_id = %request.attempt_id,
            checkout_request_id = %push.checkout_request_id,
            amount = amount,
            "M-Pesa STK push sent"
        );

        Ok(ChargeInitiated {
            provider_reference: push.checkout_request_id,
            action: UserFacingAction::PromptSent {
                message: push
                    .customer_message
                    .unwrap_or_else(|| "Check your phone to complete the payment".to_string()),
            },
        })
    }

    async fn poll_status(&self, provider_reference: &str) -> Result<Outcome, ProviderError> {
        let (password, timestamp) = self.credentials();
        let payload = StkQueryRequest {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            checkout_request_id: provider_reference,
        };

        let url = self.url("/mpesa/stkpushquery/v1/query");
        let (status, body) = self
            .send(|token| self.client.post(&url).bearer_auth(token).json(&payload))
            .await?;

        if !status.is_success() {
            let error: DarajaError = serde_json::from_str(&body).unwrap_or_default();
            if error.error_code.as_deref() == Some(ERROR_STILL_PROCESSING) {
                tracing::debug!(
                    checkout_request_id = %provider_reference,
                    message = ?error.error_message,
                    "M-Pesa transaction still processing"
                );
                return Ok(Outcome::pending(provider_reference));
            }
            return Err(status_error(status, &body));
        }

        let query: StkQueryResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::Unavailable(format!("unreadable STK query response: {}", e))
        })?;

        match query.result_code.as_ref().and_then(lenient_i64) {
            Some(0) => Ok(Outcome::Success {
                provider_reference: provider_reference.to_string(),
                receipt_id: None,
                amount_confirmed: None,
                metadata: BTreeMap::new(),
            }),
            Some(code) => {
                tracing::info!(
                    checkout_request_id = %provider_reference,
                    result_code = code,
                    result_desc = ?query.result_desc,
                    "M-Pesa query reported a final failure"
                );
                Ok(failure_for_code(provider_reference.to_string(), code))
            }
            None => Ok(Outcome::pending(provider_reference)),
        }
    }

    async fn parse_callback(
        &self,
        callback: &InboundCallback,
    ) -> Result<Option<Outcome>, ProviderError> {
        self.authenticate(callback)?;

        let envelope: CallbackEnvelope = serde_json::from_str(&callback.body)
            .map_err(|e| ProviderError::InvalidCallback(format!("malformed STK callback: {}", e)))?;

        self.callback_outcome(envelope.body.stk_callback).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use serde_json::json;

    fn provider(secret: &str) -> MpesaProvider {
        MpesaProvider::new(
            reqwest::Client::new(),
            MpesaConfig {
                consumer_key: "key".into(),
                consumer_secret: Secret::new("secret".into()),
                passkey: Secret::new("passkey".into()),
                shortcode: "174379".into(),
                api_base_url: "http://127.0.0.1:9".into(),
                callback_url: "https://premium.example.com/webhooks/mpesa".into(),
                callback_secret: Secret::new(secret.into()),
                currency: "KES".into(),
                transaction_desc: "Premium Subscription".into(),
            },
        )
    }

    fn callback_with_token(token: Option<&str>, body: Value) -> InboundCallback {
        let mut callback = InboundCallback {
            body: body.to_string(),
            ..Default::default()
        };
        if let Some(token) = token {
            callback.query.insert("token".into(), token.into());
        }
        callback
    }

    #[test]
    fn normalizes_kenyan_numbers() {
        assert_eq!(normalize_phone("0712 345 678").unwrap(), "254712345678");
        assert_eq!(normalize_phone("+254712345678").unwrap(), "254712345678");
        assert_eq!(normalize_phone("712345678").unwrap(), "254712345678");
        assert!(normalize_phone("12").is_err());
    }

    #[test]
    fn password_is_base64_of_concatenation() {
        let password = stk_password("174379", "pk", "20260101120000");
        let decoded = STANDARD.decode(password).unwrap();
        assert_eq!(decoded, b"174379pk20260101120000");
    }

    #[test]
    fn timestamp_has_daraja_shape() {
        let ts = daraja_timestamp();
        assert_eq!(ts.len(), 14);
        assert!(ts.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn callback_url_carries_token() {
        assert_eq!(
            provider("s3cr3t&x").callback_url(),
            "https://premium.example.com/webhooks/mpesa?token=s3cr3t%26x"
        );
    }

    #[tokio::test]
    async fn successful_callback_maps_metadata() {
        let body = json!({
            "Body": { "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": { "Item": [
                    { "Name": "Amount", "Value": 1299 },
                    { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                    { "Name": "Balance" },
                    { "Name": "TransactionDate", "Value": 20191219102115u64 },
                    { "Name": "PhoneNumber", "Value": 254708374149u64 }
                ]}
            }}
        });

        let outcome = provider("tok")
            .parse_callback(&callback_with_token(Some("tok"), body))
            .await
            .unwrap()
            .unwrap();

        match outcome {
            Outcome::Success {
                provider_reference,
                receipt_id,
                amount_confirmed,
                metadata,
            } => {
                assert_eq!(provider_reference, "ws_CO_191220191020363925");
                assert_eq!(receipt_id.as_deref(), Some("NLJ7RT61SV"));
                assert_eq!(amount_confirmed, Some(Money::from_major(1299, "KES")));
                assert_eq!(metadata["phone_number"], "254708374149");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_callback_sets_payer_flag() {
        let body = json!({
            "Body": { "stkCallback": {
                "CheckoutRequestID": "ws_CO_1",
                "ResultCode": "1032",
                "ResultDesc": "Request cancelled by user"
            }}
        });

        let outcome = provider("tok")
            .parse_callback(&callback_with_token(Some("tok"), body))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Some(Outcome::Failure {
                provider_reference: "ws_CO_1".into(),
                reason_code: "CANCELLED_BY_USER".into(),
                cancelled_by_payer: true,
            })
        );
    }

    #[tokio::test]
    async fn wrong_or_missing_token_is_rejected() {
        let body = json!({ "Body": { "stkCallback": { "CheckoutRequestID": "x", "ResultCode": 0 } } });

        for token in [None, Some("nope")] {
            let err = provider("tok")
                .parse_callback(&callback_with_token(token, body.clone()))
                .await
                .unwrap_err();
            assert!(matches!(err, ProviderError::InvalidCallback(_)));
        }
    }

    #[tokio::test]
    async fn unset_secret_rejects_everything() {
        let body = json!({ "Body": { "stkCallback": { "CheckoutRequestID": "x", "ResultCode": 0 } } });
        let err = provider("")
            .parse_callback(&callback_with_token(Some(""), body))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidCallback(_)));
    }
}
