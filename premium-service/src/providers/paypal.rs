//! PayPal Orders v2 adapter.
//!
//! Orders are created with intent `CAPTURE`; the payer approves on PayPal and
//! is redirected back, after which the order is captured. Webhooks are
//! authenticated through PayPal's `verify-webhook-signature` endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    excerpt, send_with_token, status_error, AccessToken, ChargeInitiated, ChargeRequest,
    InboundCallback, PaymentProvider, ProviderError, TokenCache, UserFacingAction,
};
use crate::config::PaypalConfig;
use crate::models::{Money, Outcome, Provider};

/// PayPal states token lifetimes of roughly nine hours.
const DEFAULT_TOKEN_LIFETIME_SECONDS: i64 = 32_400;

const TRANSMISSION_HEADERS: [&str; 5] = [
    "paypal-auth-algo",
    "paypal-cert-url",
    "paypal-transmission-id",
    "paypal-transmission-sig",
    "paypal-transmission-time",
];

pub struct PaypalProvider {
    client: reqwest::Client,
    config: PaypalConfig,
    tokens: TokenCache,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    intent: &'static str,
    purchase_units: Vec<PurchaseUnitRequest<'a>>,
    application_context: ApplicationContext<'a>,
}

#[derive(Debug, Serialize)]
struct PurchaseUnitRequest<'a> {
    reference_id: String,
    custom_id: &'a str,
    description: &'static str,
    amount: Amount,
}

#[derive(Debug, Serialize)]
struct ApplicationContext<'a> {
    brand_name: &'a str,
    landing_page: &'static str,
    user_action: &'static str,
    shipping_preference: &'static str,
    return_url: &'a str,
    cancel_url: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Amount {
    currency_code: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct Order {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
    payer: Option<Payer>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    payments: Option<Payments>,
}

#[derive(Debug, Deserialize)]
struct Payments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: String,
    amount: Option<Amount>,
    status_details: Option<StatusDetails>,
    supplementary_data: Option<SupplementaryData>,
}

#[derive(Debug, Deserialize)]
struct StatusDetails {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SupplementaryData {
    related_ids: Option<RelatedIds>,
}

#[derive(Debug, Deserialize)]
struct RelatedIds {
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Payer {
    email_address: Option<String>,
    payer_id: Option<String>,
    name: Option<PayerName>,
}

#[derive(Debug, Deserialize)]
struct PayerName {
    given_name: Option<String>,
    surname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    name: Option<String>,
    message: Option<String>,
    #[serde(default)]
    details: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    issue: String,
}

impl ApiError {
    fn has_issue(&self, issue: &str) -> bool {
        self.details.iter().any(|d| d.issue == issue)
    }

    fn first_issue(&self) -> String {
        self.details
            .first()
            .map(|d| d.issue.clone())
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| "UNPROCESSABLE_ENTITY".to_string())
    }
}

#[derive(Debug, Serialize)]
struct VerifySignatureRequest<'a> {
    auth_algo: &'a str,
    cert_url: &'a str,
    transmission_id: &'a str,
    transmission_sig: &'a str,
    transmission_time: &'a str,
    webhook_id: &'a str,
    webhook_event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VerifySignatureResponse {
    verification_status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    id: String,
    event_type: String,
    resource: serde_json::Value,
}

impl PaypalProvider {
    pub fn new(client: reqwest::Client, config: PaypalConfig) -> Self {
        Self {
            client,
            config,
            tokens: TokenCache::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    async fn fetch_token(&self) -> Result<AccessToken, ProviderError> {
        let response = self
            .client
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(
                &self.config.client_id,
                Some(self.config.client_secret.expose_secret()),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            tracing::error!(status = %status, body = %excerpt(&body), "PayPal token exchange failed");
            return Err(ProviderError::Unavailable(format!(
                "PayPal token exchange failed with HTTP {}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::Unavailable(format!("unreadable PayPal token response: {}", e))
        })?;
        tracing::debug!("PayPal access token refreshed");

        Ok(AccessToken::new(
            token.access_token,
            token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECONDS),
        ))
    }

    async fn send<B>(&self, build: B) -> Result<(StatusCode, String), ProviderError>
    where
        B: Fn(&str) -> reqwest::RequestBuilder,
    {
        let response =
            send_with_token(Provider::Paypal, &self.tokens, || self.fetch_token(), build).await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    async fn get_order(&self, order_id: &str) -> Result<Order, ProviderError> {
        let url = self.url(&format!("/v2/checkout/orders/{}", order_id));
        let (status, body) = self
            .send(|token| self.client.get(&url).bearer_auth(token))
            .await?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        parse_order(&body)
    }

    async fn capture(&self, order_id: &str) -> Result<Outcome, ProviderError> {
        let url = self.url(&format!("/v2/checkout/orders/{}/capture", order_id));
        let request_id = format!("capture-{}", order_id);
        let (status, body) = self
            .send(|token| {
                self.client
                    .post(&url)
                    .bearer_auth(token)
                    .header("PayPal-Request-Id", &request_id)
                    .header("Prefer", "return=representation")
                    .json(&serde_json::json!({}))
            })
            .await?;

        if status.is_success() {
            let order = parse_order(&body)?;
            tracing::info!(order_id = %order.id, status = %order.status, "PayPal order captured");
            return outcome_from_order(&order);
        }

        match status {
            StatusCode::UNPROCESSABLE_ENTITY => {
                let error: ApiError = serde_json::from_str(&body).unwrap_or_default();
                if error.has_issue("ORDER_ALREADY_CAPTURED") {
                    tracing::info!(order_id = %order_id, "PayPal order already captured, fetching");
                    let order = self.get_order(order_id).await?;
                    return outcome_from_order(&order);
                }
                if error.has_issue("ORDER_NOT_APPROVED") {
                    return Ok(Outcome::pending(order_id));
                }
                // The buyer can return to the approval page with another funding source.
                if error.has_issue("INSTRUMENT_DECLINED") {
                    tracing::info!(order_id = %order_id, "PayPal declined the funding source, order stays open");
                    return Ok(Outcome::pending(order_id));
                }
                let issue = error.first_issue();
                tracing::warn!(
                    order_id = %order_id,
                    issue = %issue,
                    message = ?error.message,
                    "PayPal refused capture"
                );
                Ok(Outcome::failure(order_id, issue))
            }
            StatusCode::NOT_FOUND => Ok(Outcome::failure(order_id, "ORDER_NOT_FOUND")),
            _ => Err(status_error(status, &body)),
        }
    }

    async fn verify_webhook(
        &self,
        callback: &InboundCallback,
        event: serde_json::Value,
    ) -> Result<(), ProviderError> {
        let webhook_id = self.config.webhook_id.as_deref().ok_or_else(|| {
            ProviderError::InvalidCallback("PayPal webhook id is not configured".to_string())
        })?;

        let mut headers = BTreeMap::new();
        for name in TRANSMISSION_HEADERS {
            let value = callback
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ProviderError::InvalidCallback(format!("missing {} header", name)))?;
            headers.insert(name, value);
        }

        let request = VerifySignatureRequest {
            auth_algo: headers["paypal-auth-algo"],
            cert_url: headers["paypal-cert-url"],
            transmission_id: headers["paypal-transmission-id"],
            transmission_sig: headers["paypal-transmission-sig"],
            transmission_time: headers["paypal-transmission-time"],
            webhook_id,
            webhook_event: event,
        };

        let url = self.url("/v1/notifications/verify-webhook-signature");
        let (status, body) = self
            .send(|token| self.client.post(&url).bearer_auth(token).json(&request))
            .await?;

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(status_error(status, &body));
        }
        if !status.is_success() {
            return Err(ProviderError::InvalidCallback(format!(
                "signature verification refused with HTTP {}",
                status.as_u16()
            )));
        }

        let verdict: VerifySignatureResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::Unavailable(format!("unreadable verification response: {}", e))
        })?;
        if verdict.verification_status != "SUCCESS" {
            return Err(ProviderError::InvalidCallback(format!(
                "signature verification returned {}",
                verdict.verification_status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for PaypalProvider {
    fn provider(&self) -> Provider {
        Provider::Paypal
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Order creation carries `PayPal-Request-Id`.
    fn deduplicates_charges(&self) -> bool {
        true
    }

    async fn create_charge(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeInitiated, ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured(Provider::Paypal));
        }

        let attempt_id = request.attempt_id.to_string();
        let payload = CreateOrderRequest {
            intent: "CAPTURE",
            purchase_units: vec![PurchaseUnitRequest {
                reference_id: attempt_id.clone(),
                custom_id: &request.user_id,
                description: request.plan.description(),
                amount: Amount {
                    currency_code: request.amount.currency.clone(),
                    value: request.amount.to_decimal_string(),
                },
            }],
            application_context: ApplicationContext {
                brand_name: &self.config.brand_name,
                landing_page: "BILLING",
                user_action: "PAY_NOW",
                shipping_preference: "NO_SHIPPING",
                return_url: &self.config.return_url,
                cancel_url: &self.config.cancel_url,
            },
        };

        let url = self.url("/v2/checkout/orders");
        let (status, body) = self
            .send(|token| {
                self.client
                    .post(&url)
                    .bearer_auth(token)
                    .header("PayPal-Request-Id", &attempt_id)
                    .header("Prefer", "return=representation")
                    .json(&payload)
            })
            .await?;

        if !status.is_success() {
            tracing::error!(
                attempt_id = %attempt_id,
                status = %status,
                body = %excerpt(&body),
                "PayPal order creation failed"
            );
            return Err(status_error(status, &body));
        }

        let order = parse_order(&body)?;
        let approve = order
            .links
            .iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .ok_or_else(|| {
                ProviderError::Unavailable(format!("order {} has no approval link", order.id))
            })?;

        tracing::info!(
            attempt_id = %attempt_id,
            order_id = %order.id,
            amount = %request.amount,
            "PayPal order created"
        );

        Ok(ChargeInitiated {
            provider_reference: order.id.clone(),
            action: UserFacingAction::Redirect {
                url: approve.href.clone(),
            },
        })
    }

    async fn poll_status(&self, provider_reference: &str) -> Result<Outcome, ProviderError> {
        let order = match self.get_order(provider_reference).await {
            Ok(order) => order,
            Err(ProviderError::Rejected { status: 404, .. }) => {
                return Ok(Outcome::failure(provider_reference, "ORDER_NOT_FOUND"));
            }
            Err(e) => return Err(e),
        };

        if order.status == "APPROVED" {
            return self.capture(&order.id).await;
        }
        outcome_from_order(&order)
    }

    async fn parse_callback(
        &self,
        callback: &InboundCallback,
    ) -> Result<Option<Outcome>, ProviderError> {
        let raw: serde_json::Value = serde_json::from_str(&callback.body)
            .map_err(|e| ProviderError::InvalidCallback(format!("body is not JSON: {}", e)))?;

        self.verify_webhook(callback, raw.clone()).await?;

        let event: WebhookEvent = serde_json::from_value(raw)
            .map_err(|e| ProviderError::InvalidCallback(format!("malformed event: {}", e)))?;

        tracing::info!(event_id = %event.id, event_type = %event.event_type, "PayPal webhook verified");
        outcome_from_event(event)
    }

    async fn capture_return(&self, provider_reference: &str) -> Result<Outcome, ProviderError> {
        self.capture(provider_reference).await
    }
}

fn parse_order(body: &str) -> Result<Order, ProviderError> {
    serde_json::from_str(body)
        .map_err(|e| ProviderError::Unavailable(format!("unreadable PayPal order: {}", e)))
}

fn parse_amount(amount: &Amount) -> Result<Money, ProviderError> {
    Money::parse(&amount.value, &amount.currency_code)
        .map_err(|e| ProviderError::Unavailable(format!("unreadable PayPal amount: {}", e)))
}

fn payer_metadata(payer: Option<&Payer>) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let Some(payer) = payer else {
        return metadata;
    };

    if let Some(email) = &payer.email_address {
        metadata.insert("payer_email".to_string(), email.clone());
    }
    if let Some(id) = &payer.payer_id {
        metadata.insert("payer_id".to_string(), id.clone());
    }
    if let Some(name) = &payer.name {
        let full = [name.given_name.as_deref(), name.surname.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            metadata.insert("payer_name".to_string(), full);
        }
    }
    metadata
}

fn capture_outcome(
    order_id: &str,
    capture: &Capture,
    metadata: BTreeMap<String, String>,
) -> Result<Outcome, ProviderError> {
    match capture.status.as_str() {
        "COMPLETED" => Ok(Outcome::Success {
            provider_reference: order_id.to_string(),
            receipt_id: Some(capture.id.clone()),
            amount_confirmed: capture.amount.as_ref().map(parse_amount).transpose()?,
            metadata,
        }),
        "DECLINED" | "FAILED" => {
            let reason = capture
                .status_details
                .as_ref()
                .and_then(|d| d.reason.clone())
                .unwrap_or_else(|| format!("CAPTURE_{}", capture.status));
            Ok(Outcome::failure(order_id, reason))
        }
        _ => Ok(Outcome::pending(order_id)),
    }
}

fn outcome_from_order(order: &Order) -> Result<Outcome, ProviderError> {
    match order.status.as_str() {
        "COMPLETED" => {
            let capture = order
                .purchase_units
                .iter()
                .filter_map(|unit| unit.payments.as_ref())
                .flat_map(|payments| payments.captures.iter())
                .next();

            match capture {
                Some(capture) => {
                    capture_outcome(&order.id, capture, payer_metadata(order.payer.as_ref()))
                }
                None => Ok(Outcome::pending(&order.id)),
            }
        }
        "VOIDED" => Ok(Outcome::failure(&order.id, "ORDER_VOIDED")),
        _ => Ok(Outcome::pending(&order.id)),
    }
}

fn outcome_from_event(event: WebhookEvent) -> Result<Option<Outcome>, ProviderError> {
    match event.event_type.as_str() {
        "PAYMENT.CAPTURE.COMPLETED" | "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => {
            let capture: Capture = serde_json::from_value(event.resource).map_err(|e| {
                ProviderError::InvalidCallback(format!("malformed capture resource: {}", e))
            })?;

            let Some(order_id) = capture
                .supplementary_data
                .as_ref()
                .and_then(|s| s.related_ids.as_ref())
                .and_then(|r| r.order_id.clone())
            else {
                tracing::warn!(
                    event_id = %event.id,
                    capture_id = %capture.id,
                    "PayPal capture event without order id, ignoring"
                );
                return Ok(None);
            };

            if event.event_type == "PAYMENT.CAPTURE.COMPLETED" {
                let mut metadata = BTreeMap::new();
                metadata.insert("webhook_event_id".to_string(), event.id);
                capture_outcome(&order_id, &capture, metadata).map(Some)
            } else {
                Ok(Some(Outcome::failure(
                    order_id,
                    event.event_type.replace("PAYMENT.", "").replace('.', "_"),
                )))
            }
        }
        "CHECKOUT.ORDER.APPROVED" => {
            let order_id = event
                .resource
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProviderError::InvalidCallback("order event without id".into()))?;
            Ok(Some(Outcome::pending(order_id)))
        }
        other => {
            tracing::debug!(event_type = %other, "Ignoring PayPal event");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completed_order(amount: &str) -> Order {
        serde_json::from_value(json!({
            "id": "ORDER-1",
            "status": "COMPLETED",
            "payer": {
                "email_address": "payer@example.com",
                "name": { "given_name": "Ada", "surname": "Lovelace" }
            },
            "purchase_units": [{
                "payments": {
                    "captures": [{
                        "id": "CAP-1",
                        "status": "COMPLETED",
                        "amount": { "currency_code": "USD", "value": amount }
                    }]
                }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn completed_order_maps_to_success_with_payer() {
        let outcome = outcome_from_order(&completed_order("9.99")).unwrap();
        match outcome {
            Outcome::Success {
                provider_reference,
                receipt_id,
                amount_confirmed,
                metadata,
            } => {
                assert_eq!(provider_reference, "ORDER-1");
                assert_eq!(receipt_id.as_deref(), Some("CAP-1"));
                assert_eq!(amount_confirmed, Some(Money::new(999, "USD")));
                assert_eq!(metadata["payer_email"], "payer@example.com");
                assert_eq!(metadata["payer_name"], "Ada Lovelace");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn unreadable_amount_is_not_a_terminal_outcome() {
        assert!(outcome_from_order(&completed_order("lots")).is_err());
    }

    #[test]
    fn voided_and_created_orders() {
        let voided: Order =
            serde_json::from_value(json!({ "id": "O", "status": "VOIDED" })).unwrap();
        assert_eq!(
            outcome_from_order(&voided).unwrap(),
            Outcome::failure("O", "ORDER_VOIDED")
        );

        let created: Order =
            serde_json::from_value(json!({ "id": "O", "status": "CREATED" })).unwrap();
        assert_eq!(outcome_from_order(&created).unwrap(), Outcome::pending("O"));
    }

    #[test]
    fn capture_completed_event_uses_related_order() {
        let event: WebhookEvent = serde_json::from_value(json!({
            "id": "WH-1",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAP-9",
                "status": "COMPLETED",
                "amount": { "currency_code": "USD", "value": "99.99" },
                "supplementary_data": { "related_ids": { "order_id": "ORDER-9" } }
            }
        }))
        .unwrap();

        let outcome = outcome_from_event(event).unwrap().unwrap();
        assert_eq!(outcome.provider_reference(), "ORDER-9");
        assert_eq!(outcome.label(), "success");
    }

    #[test]
    fn denied_event_is_failure() {
        let event: WebhookEvent = serde_json::from_value(json!({
            "id": "WH-2",
            "event_type": "PAYMENT.CAPTURE.DENIED",
            "resource": {
                "id": "CAP-2",
                "status": "DECLINED",
                "supplementary_data": { "related_ids": { "order_id": "ORDER-2" } }
            }
        }))
        .unwrap();

        assert_eq!(
            outcome_from_event(event).unwrap(),
            Some(Outcome::failure("ORDER-2", "CAPTURE_DENIED"))
        );
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let event: WebhookEvent = serde_json::from_value(json!({
            "id": "WH-3",
            "event_type": "BILLING.PLAN.CREATED",
            "resource": {}
        }))
        .unwrap();
        assert_eq!(outcome_from_event(event).unwrap(), None);
    }

    #[test]
    fn api_error_issue_lookup() {
        let error: ApiError = serde_json::from_value(json!({
            "name": "UNPROCESSABLE_ENTITY",
            "details": [{ "issue": "ORDER_ALREADY_CAPTURED" }]
        }))
        .unwrap();
        assert!(error.has_issue("ORDER_ALREADY_CAPTURED"));
        assert_eq!(error.first_issue(), "ORDER_ALREADY_CAPTURED");
        assert_eq!(ApiError::default().first_issue(), "UNPROCESSABLE_ENTITY");
    }
}
