//! Application startup and lifecycle management.

use axum::middleware::{from_fn, from_fn_with_state};
use axum::{
    routing::{get, post},
    Router,
};
use mongodb::{options::ClientOptions, Client};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::{
    http::{metrics_middleware, request_id_middleware, REQUEST_ID_HEADER},
    signature::{signature_validation_middleware, SignatureConfig, SignatureStore},
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers;
use crate::providers::{
    build_http_client, mpesa::MpesaProvider, paypal::PaypalProvider, ProviderRegistry,
};
use crate::services::{
    EntitlementStore, MongoEntitlementStore, MongoPaymentLedger, PaymentLedger, PremiumService,
};
use crate::workers::ReconciliationSweep;

/// Paths reachable without a signed request. Provider callbacks carry
/// their own authentication.
pub const UNSIGNED_PATHS: [&str; 5] = [
    "/health",
    "/ready",
    "/metrics",
    "/webhooks/paypal",
    "/webhooks/mpesa",
];

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PremiumService>,
    pub redis: redis::Client,
    pub signature_config: SignatureConfig,
    pub signing_secret: Secret<String>,
    pub nonce_expiry_seconds: usize,
}

impl AsRef<SignatureConfig> for AppState {
    fn as_ref(&self) -> &SignatureConfig {
        &self.signature_config
    }
}

#[axum::async_trait]
impl SignatureStore for AppState {
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError> {
        let mut con = self
            .redis
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to get redis connection");
                AppError::RedisError(e)
            })?;

        // SET NX is the replay check: it only succeeds for an unseen nonce.
        let key = format!("premium:nonce:{}", nonce);
        let stored: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.nonce_expiry_seconds)
            .query_async(&mut con)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to store nonce");
                AppError::RedisError(e)
            })?;

        Ok(stored.is_some())
    }

    async fn get_signing_secret(&self, _client_id: &str) -> Result<Option<String>, AppError> {
        // A single shared secret is issued to the gateway.
        Ok(Some(self.signing_secret.expose_secret().clone()))
    }
}

/// Routes and middleware stack, separate from binding so tests can drive it
/// with `oneshot`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route("/premium/checkout", post(handlers::checkout::create_checkout))
        .route(
            "/premium/paypal/capture",
            post(handlers::checkout::capture_paypal),
        )
        .route(
            "/premium/paypal/return",
            get(handlers::checkout::paypal_return),
        )
        .route(
            "/premium/paypal/cancel",
            get(handlers::checkout::paypal_cancel),
        )
        .route("/premium/status", get(handlers::status::premium_status))
        .route("/premium/payments", get(handlers::status::payment_history))
        .route(
            "/premium/payments/:id/status",
            get(handlers::status::payment_status),
        )
        .route("/webhooks/paypal", post(handlers::webhooks::paypal_webhook))
        .route("/webhooks/mpesa", post(handlers::webhooks::mpesa_callback))
        .layer(from_fn_with_state(
            state.clone(),
            signature_validation_middleware::<AppState>,
        ))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    sweep: ReconciliationSweep,
}

impl Application {
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let mut client_options = ClientOptions::parse(config.database.url.expose_secret())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to parse MongoDB connection string");
                AppError::DatabaseError(e.into())
            })?;
        client_options.app_name = Some(config.service_name.clone());

        let client = Client::with_options(client_options).map_err(|e| {
            tracing::error!(error = %e, "Failed to create MongoDB client");
            AppError::DatabaseError(e.into())
        })?;
        let db = client.database(&config.database.db_name);

        let redis = redis::Client::open(config.redis.url.expose_secret().as_str())?;

        let ledger = MongoPaymentLedger::new(&db);
        ledger.init_indexes().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to initialize payment attempt indexes");
            AppError::DatabaseError(e)
        })?;

        let entitlements = MongoEntitlementStore::new(&db);
        entitlements.init_indexes().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to initialize entitlement indexes");
            AppError::DatabaseError(e)
        })?;

        let http_client = build_http_client(&config.providers)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let paypal = PaypalProvider::new(http_client.clone(), config.paypal.clone());
        let mpesa = MpesaProvider::new(http_client, config.mpesa.clone());
        if !config.paypal.is_configured() {
            tracing::warn!("PayPal credentials not configured - PayPal checkout disabled");
        }
        if !config.mpesa.is_configured() {
            tracing::warn!("M-Pesa credentials not configured - M-Pesa checkout disabled");
        }
        let providers = ProviderRegistry::new()
            .register(Arc::new(paypal))
            .register(Arc::new(mpesa));

        let ledger: Arc<dyn PaymentLedger> = Arc::new(ledger);
        let entitlements: Arc<dyn EntitlementStore> = Arc::new(entitlements);

        let service = Arc::new(PremiumService::new(
            ledger.clone(),
            entitlements,
            providers,
            config.pricing.clone(),
            config.providers.charge_retry_max_elapsed,
        ));

        let sweep = ReconciliationSweep::new(service.clone(), ledger, config.sweep.clone());

        let signature_config = SignatureConfig {
            require_signatures: config.signature.enabled,
            excluded_paths: UNSIGNED_PATHS.iter().map(|p| p.to_string()).collect(),
            ..SignatureConfig::default()
        };

        let state = AppState {
            service,
            redis,
            signature_config,
            signing_secret: config.signature.secret.clone(),
            nonce_expiry_seconds: config.signature.expiry_seconds,
        };

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid bind address: {}", e)))?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            providers = ?state.service.configured_providers(),
            sweep_enabled = config.sweep.enabled,
            "premium-service initialized"
        );

        Ok(Self {
            port,
            listener,
            router: router(state),
            sweep,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `shutdown` resolves, then stop the sweep.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweep_token = self.sweep.shutdown_token();
        let sweep_handle = tokio::spawn(self.sweep.start());

        tracing::info!(port = self.port, "Listening");
        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await;

        sweep_token.cancel();
        if let Err(e) = sweep_handle.await {
            tracing::error!(error = %e, "Reconciliation sweep task failed");
        }

        result
    }
}
