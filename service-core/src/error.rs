use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Seconds a client is asked to wait when storage is unreachable.
const STORAGE_RETRY_AFTER_SECS: u64 = 2;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    /// Caller identity is missing or malformed.
    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    /// Request signature or callback credential did not verify.
    #[error("Authentication error: {0}")]
    AuthError(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    /// A payment provider answered with something we cannot act on.
    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    /// A payment provider is temporarily unreachable.
    #[error("Service unavailable: {message}")]
    ServiceUnavailable {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        AppError::ServiceUnavailable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) | AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable { .. }
            | AppError::DatabaseError(_)
            | AppError::RedisError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_) | AppError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::ServiceUnavailable { retry_after, .. } => *retry_after,
            AppError::DatabaseError(_) | AppError::RedisError(_) => Some(STORAGE_RETRY_AFTER_SECS),
            _ => None,
        }
    }

    /// Client-facing body. Storage and internal failures are logged, not echoed.
    fn body(&self) -> ErrorBody {
        let (error, details) = match self {
            AppError::ValidationError(err) => ("Validation error".to_string(), Some(err.to_string())),
            AppError::BadRequest(err)
            | AppError::NotFound(err)
            | AppError::Unauthorized(err)
            | AppError::AuthError(err) => (err.to_string(), None),
            AppError::BadGateway(msg) => (format!("Payment provider error: {}", msg), None),
            AppError::ServiceUnavailable { message, .. } => (message.clone(), None),
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Payment storage unavailable");
                ("Payment storage temporarily unavailable, try again".to_string(), None)
            }
            AppError::RedisError(err) => {
                tracing::error!(error = %err, "Nonce store unavailable");
                ("Request could not be verified, try again".to_string(), None)
            }
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal error");
                ("Internal server error".to_string(), None)
            }
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                ("Internal server error".to_string(), None)
            }
        };
        ErrorBody { error, details }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.into())
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        AppError::DatabaseError(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();
        if let Some(secs) = self.retry_after() {
            response.headers_mut().insert(header::RETRY_AFTER, secs.into());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_outage_sets_retry_after() {
        let response = AppError::ServiceUnavailable {
            message: "payment could not be started, try again".to_string(),
            retry_after: Some(5),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "5");
    }

    #[test]
    fn storage_failure_is_retryable() {
        let err = AppError::DatabaseError(anyhow::anyhow!("connection reset"));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = err.into_response();
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }

    #[test]
    fn missing_attempt_maps_to_404() {
        let response = AppError::NotFound(anyhow::anyhow!("Payment not found")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn bad_signature_is_unauthorized() {
        let err = AppError::AuthError(anyhow::anyhow!("Invalid signature"));
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}
