//! HMAC request signing for the web tier calling the premium API.
//!
//! Callers sign `method|path|timestamp|nonce|sha256(body)` with a shared
//! secret and send it as `X-Client-ID`, `X-Timestamp`, `X-Nonce` and
//! `X-Signature` headers, or as the matching query parameters. Provider
//! callbacks carry their own credentials and are listed in `excluded_paths`.

use crate::error::AppError;
use crate::utils::signature::verify_signature;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;
use serde::Deserialize;

#[derive(Clone, Debug)]
pub struct SignatureConfig {
    pub require_signatures: bool,
    pub excluded_paths: Vec<String>,
    pub max_clock_skew_secs: i64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            require_signatures: false,
            excluded_paths: Vec::new(),
            max_clock_skew_secs: 60,
        }
    }
}

impl SignatureConfig {
    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|p| path.starts_with(p.as_str()))
    }
}

#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Records the nonce. `false` means it was already used.
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError>;
    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError>;
}

fn rejected(reason: &'static str) -> AppError {
    AppError::AuthError(anyhow::anyhow!(reason))
}

#[derive(Debug, Deserialize)]
struct SignedRequest {
    client_id: String,
    timestamp: String,
    nonce: String,
    signature: String,
}

impl SignedRequest {
    fn is_signed(req: &Request) -> bool {
        req.headers().contains_key("X-Signature")
            || req.uri().query().is_some_and(|q| q.contains("signature="))
    }

    fn from_request(req: &Request) -> Result<Self, AppError> {
        let headers = req.headers();
        if headers.contains_key("X-Signature") {
            let get = |name: &'static str| -> Result<String, AppError> {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing or invalid header: {}", name)))
            };
            return Ok(Self {
                client_id: get("X-Client-ID")?,
                timestamp: get("X-Timestamp")?,
                nonce: get("X-Nonce")?,
                signature: get("X-Signature")?,
            });
        }

        req.uri()
            .query()
            .and_then(|q| serde_urlencoded::from_str::<Self>(q).ok())
            .ok_or_else(|| rejected("Missing signature data"))
    }

    fn timestamp_within(&self, max_skew_secs: i64) -> Result<i64, AppError> {
        let ts: i64 = self
            .timestamp
            .parse()
            .map_err(|_| rejected("Invalid timestamp format"))?;
        if (chrono::Utc::now().timestamp() - ts).abs() > max_skew_secs {
            return Err(rejected("Request timestamp expired"));
        }
        Ok(ts)
    }
}

pub async fn signature_validation_middleware<S>(
    State(state): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: AsRef<SignatureConfig> + SignatureStore + Clone + Send + Sync + 'static,
{
    let config = state.as_ref();
    if config.is_excluded(req.uri().path())
        || (!config.require_signatures && !SignedRequest::is_signed(&req))
    {
        return Ok(next.run(req).await);
    }

    let signed = SignedRequest::from_request(&req)?;
    let timestamp = signed.timestamp_within(config.max_clock_skew_secs)?;

    if !state.validate_nonce(&signed.nonce).await? {
        return Err(rejected("Replay detected (nonce used)"));
    }
    let secret = state
        .get_signing_secret(&signed.client_id)
        .await?
        .ok_or_else(|| rejected("Invalid Client ID"))?;

    let (parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Failed to read body: {}", e)))?
        .to_bytes();

    let valid = verify_signature(
        &secret,
        parts.method.as_str(),
        parts.uri.path(),
        timestamp,
        &signed.nonce,
        std::str::from_utf8(&bytes).unwrap_or_default(),
        &signed.signature,
    )?;
    if !valid {
        tracing::warn!(client_id = %signed.client_id, path = %parts.uri.path(), "Rejected request with invalid signature");
        return Err(rejected("Invalid signature"));
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
