//! Payment provider adapters.
//!
//! Each adapter turns one provider's API into the provider-agnostic
//! [`Outcome`] consumed by the reconciliation engine. Adapters never touch
//! the ledger.

pub mod mpesa;
pub mod paypal;
pub mod token_cache;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ProviderHttpConfig;
use crate::models::{AttemptId, Money, Outcome, Plan, Provider};

pub use mpesa::MpesaProvider;
pub use paypal::PaypalProvider;
pub use token_cache::{AccessToken, TokenCache};

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network failure, timeout, 5xx or token failure. Never terminal.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The request never left this service: no connection could be opened
    /// or no access token could be obtained. Always safe to repeat.
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    /// The provider refused the request outright (4xx other than 401).
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    #[error("{0} is not configured")]
    NotConfigured(Provider),

    #[error("invalid charge request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::Unreachable(_)
        )
    }

    /// `true` only when the provider certainly never saw the request.
    pub fn never_sent(&self) -> bool {
        matches!(self, ProviderError::Unreachable(_))
    }

    /// A transient failure that happened before the main request went out.
    fn before_send(self) -> Self {
        match self {
            ProviderError::Unavailable(msg) => ProviderError::Unreachable(msg),
            other => other,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ProviderError::Unreachable(err.to_string())
        } else if err.is_timeout() {
            ProviderError::Unavailable(format!("request timed out: {}", err))
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// Everything an adapter needs to start a charge.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub attempt_id: AttemptId,
    pub user_id: String,
    pub plan: Plan,
    pub amount: Money,
    /// Required by M-Pesa, ignored by PayPal.
    pub phone_number: Option<String>,
}

/// What the client must do next to complete the payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserFacingAction {
    Redirect { url: String },
    PromptSent { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeInitiated {
    pub provider_reference: String,
    pub action: UserFacingAction,
}

/// A raw inbound push from a provider, exactly as received.
#[derive(Debug, Clone, Default)]
pub struct InboundCallback {
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub body: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn provider(&self) -> Provider;

    fn is_configured(&self) -> bool;

    /// Whether the provider deduplicates repeated `create_charge` calls for
    /// one attempt. Without that, a charge is only retried when the earlier
    /// request never left this service.
    fn deduplicates_charges(&self) -> bool {
        false
    }

    async fn create_charge(&self, request: &ChargeRequest)
        -> Result<ChargeInitiated, ProviderError>;

    async fn poll_status(&self, provider_reference: &str) -> Result<Outcome, ProviderError>;

    /// Authenticate then parse an inbound push. `Ok(None)` is an authentic
    /// event that carries nothing to reconcile.
    async fn parse_callback(
        &self,
        callback: &InboundCallback,
    ) -> Result<Option<Outcome>, ProviderError>;

    /// Explicit capture after payer approval. Providers without a capture
    /// step report the current status instead.
    async fn capture_return(&self, provider_reference: &str) -> Result<Outcome, ProviderError> {
        self.poll_status(provider_reference).await
    }
}

/// Shared HTTP client for all adapters. The request timeout bounds every
/// provider call, including token exchanges.
pub fn build_http_client(config: &ProviderHttpConfig) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| ProviderError::Unavailable(format!("failed to build http client: {}", e)))
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<Provider, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(adapter.provider(), adapter);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<&Arc<dyn PaymentProvider>, ProviderError> {
        self.providers
            .get(&provider)
            .ok_or(ProviderError::NotConfigured(provider))
    }

    pub fn configured(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self
            .providers
            .values()
            .filter(|p| p.is_configured())
            .map(|p| p.provider())
            .collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}

/// Send a bearer-authenticated request. A 401 invalidates the cached token
/// and the request is retried exactly once with a freshly fetched one.
pub(crate) async fn send_with_token<F, Fut, B>(
    provider: Provider,
    tokens: &TokenCache,
    fetch: F,
    build: B,
) -> Result<reqwest::Response, ProviderError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<AccessToken, ProviderError>>,
    B: Fn(&str) -> reqwest::RequestBuilder,
{
    let token = tokens
        .get_or_fetch(&fetch)
        .await
        .map_err(ProviderError::before_send)?;
    let response = build(&token).send().await?;
    if response.status() != reqwest::StatusCode::UNAUTHORIZED {
        return Ok(response);
    }

    tracing::warn!(provider = %provider, "Access token rejected, refreshing once");
    tokens.invalidate().await;

    let token = tokens
        .get_or_fetch(&fetch)
        .await
        .map_err(ProviderError::before_send)?;
    let response = build(&token).send().await?;
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ProviderError::Unavailable(format!(
            "{} rejected a freshly issued access token",
            provider
        )));
    }
    Ok(response)
}

/// Map a non-success response to the error taxonomy: 5xx and throttling are
/// transient, any other status is a rejection.
pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> ProviderError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Unavailable(format!("HTTP {}: {}", status.as_u16(), excerpt(body)))
    } else {
        ProviderError::Rejected {
            status: status.as_u16(),
            message: excerpt(body),
        }
    }
}

/// Short, log-safe excerpt of a provider response body.
pub(crate) fn excerpt(body: &str) -> String {
    const LIMIT: usize = 300;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
