#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use premium_service::config::{
    MpesaConfig, PaypalConfig, PlanPricing, ProviderHttpConfig, SweepConfig,
};
use premium_service::models::{AttemptId, Money, PaymentAttempt, Plan, Provider};
use premium_service::providers::{
    build_http_client, mpesa::MpesaProvider, paypal::PaypalProvider, ProviderRegistry,
};
use premium_service::services::{
    EntitlementStore, InMemoryEntitlementStore, InMemoryPaymentLedger, MongoEntitlementStore,
    MongoPaymentLedger, PaymentLedger, PremiumService,
};
use premium_service::startup::{router, AppState};
use premium_service::workers::ReconciliationSweep;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::middleware::signature::SignatureConfig;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_USER_ID: &str = "user-1";
pub const OTHER_USER_ID: &str = "user-2";
pub const MPESA_CALLBACK_SECRET: &str = "cb-secret";
pub const PAYPAL_WEBHOOK_ID: &str = "WH-TEST";
pub const TEST_PHONE: &str = "0712345678";

pub struct TestApp {
    pub address: String,
    pub paypal: MockServer,
    pub mpesa: MockServer,
    pub ledger: Arc<InMemoryPaymentLedger>,
    pub entitlements: Arc<InMemoryEntitlementStore>,
    pub service: Arc<PremiumService>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(ProviderHttpConfig {
            request_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            charge_retry_max_elapsed: Duration::from_millis(300),
        })
        .await
    }

    pub async fn spawn_with(http: ProviderHttpConfig) -> Self {
        let paypal = MockServer::start().await;
        let mpesa = MockServer::start().await;

        let http_client = build_http_client(&http).expect("Failed to build http client");
        let providers = ProviderRegistry::new()
            .register(Arc::new(PaypalProvider::new(
                http_client.clone(),
                paypal_config(&paypal.uri()),
            )))
            .register(Arc::new(MpesaProvider::new(
                http_client,
                mpesa_config(&mpesa.uri()),
            )));

        let ledger = Arc::new(InMemoryPaymentLedger::new());
        let entitlements = Arc::new(InMemoryEntitlementStore::new());
        let service = Arc::new(PremiumService::new(
            ledger.clone() as Arc<dyn PaymentLedger>,
            entitlements.clone() as Arc<dyn EntitlementStore>,
            providers,
            PlanPricing::default(),
            http.charge_retry_max_elapsed,
        ));

        let state = AppState {
            service: service.clone(),
            // Never connected: signatures are disabled in tests.
            redis: redis::Client::open("redis://127.0.0.1:6379")
                .expect("Failed to create redis client"),
            signature_config: SignatureConfig::default(),
            signing_secret: Secret::new("test-secret".to_string()),
            nonce_expiry_seconds: 300,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let port = listener.local_addr().expect("No local address").port();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            address: format!("http://127.0.0.1:{}", port),
            paypal,
            mpesa,
            ledger,
            entitlements,
            service,
            client: reqwest::Client::new(),
        }
    }

    pub fn sweep(&self, config: SweepConfig) -> ReconciliationSweep {
        ReconciliationSweep::new(
            self.service.clone(),
            self.ledger.clone() as Arc<dyn PaymentLedger>,
            config,
        )
    }

    pub fn get(&self, user_id: &str, route: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.address, route))
            .header("X-User-ID", user_id)
    }

    pub fn post(&self, user_id: &str, route: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.address, route))
            .header("X-User-ID", user_id)
    }

    /// A pending attempt with a provider reference, created `age` ago.
    pub async fn seed_pending(
        &self,
        provider: Provider,
        plan: Plan,
        reference: &str,
        age: ChronoDuration,
    ) -> AttemptId {
        let amount = PlanPricing::default().price(provider, plan);
        let mut attempt = PaymentAttempt::new_pending(TEST_USER_ID, plan, amount, provider);
        attempt.provider_reference = Some(reference.to_string());
        attempt.created_at = Utc::now() - age;
        attempt.updated_at = attempt.created_at;
        let id = attempt.id;
        self.ledger.seed(attempt).await;
        id
    }

    pub async fn attempt(&self, id: AttemptId) -> PaymentAttempt {
        self.ledger
            .find_by_id(id)
            .await
            .expect("ledger read failed")
            .expect("attempt missing")
    }
}

pub fn paypal_config(base_url: &str) -> PaypalConfig {
    PaypalConfig {
        client_id: "paypal-client".to_string(),
        client_secret: Secret::new("paypal-secret".to_string()),
        webhook_id: Some(PAYPAL_WEBHOOK_ID.to_string()),
        api_base_url: base_url.to_string(),
        brand_name: "Premium".to_string(),
        return_url: "http://localhost/premium/paypal/return".to_string(),
        cancel_url: "http://localhost/premium/paypal/cancel".to_string(),
    }
}

pub fn mpesa_config(base_url: &str) -> MpesaConfig {
    MpesaConfig {
        consumer_key: "mpesa-key".to_string(),
        consumer_secret: Secret::new("mpesa-secret".to_string()),
        passkey: Secret::new("passkey".to_string()),
        shortcode: "174379".to_string(),
        api_base_url: base_url.to_string(),
        callback_url: "http://localhost/webhooks/mpesa".to_string(),
        callback_secret: Secret::new(MPESA_CALLBACK_SECRET.to_string()),
        currency: "KES".to_string(),
        transaction_desc: "Premium".to_string(),
    }
}

pub async fn mount_paypal_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "paypal-token",
            "token_type": "Bearer",
            "expires_in": 32400
        })))
        .mount(server)
        .await;
}

pub async fn mount_mpesa_token(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/oauth/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "mpesa-token",
            "expires_in": "3599"
        })))
        .mount(server)
        .await;
}

pub async fn mount_paypal_create(server: &MockServer, order_id: &str) {
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(created_order(order_id)))
        .mount(server)
        .await;
}

pub async fn mount_stk_push(server: &MockServer, checkout_request_id: &str) {
    Mock::given(method("POST"))
        .and(path("/mpesa/stkpush/v1/processrequest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": checkout_request_id,
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success. Request accepted for processing"
        })))
        .mount(server)
        .await;
}

pub async fn mount_paypal_verification(server: &MockServer, status: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/notifications/verify-webhook-signature"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "verification_status": status })),
        )
        .mount(server)
        .await;
}

pub fn created_order(order_id: &str) -> Value {
    json!({
        "id": order_id,
        "status": "CREATED",
        "links": [
            { "href": format!("https://api.paypal.test/v2/checkout/orders/{}", order_id), "rel": "self", "method": "GET" },
            { "href": format!("https://www.paypal.test/checkoutnow?token={}", order_id), "rel": "approve", "method": "GET" }
        ]
    })
}

pub fn order(order_id: &str, status: &str) -> Value {
    json!({ "id": order_id, "status": status, "links": [] })
}

pub fn completed_order(order_id: &str, capture_id: &str, value: &str) -> Value {
    json!({
        "id": order_id,
        "status": "COMPLETED",
        "payer": {
            "email_address": "payer@example.com",
            "payer_id": "PAYER123",
            "name": { "given_name": "Ada", "surname": "Lovelace" }
        },
        "purchase_units": [{
            "reference_id": "attempt",
            "payments": {
                "captures": [{
                    "id": capture_id,
                    "status": "COMPLETED",
                    "amount": { "currency_code": "USD", "value": value }
                }]
            }
        }]
    })
}

pub fn capture_completed_event(order_id: &str, capture_id: &str, value: &str) -> Value {
    json!({
        "id": format!("WH-{}", capture_id),
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "resource": {
            "id": capture_id,
            "status": "COMPLETED",
            "amount": { "currency_code": "USD", "value": value },
            "supplementary_data": { "related_ids": { "order_id": order_id } }
        }
    })
}

pub fn paypal_webhook_headers() -> Vec<(&'static str, &'static str)> {
    vec![
        ("paypal-auth-algo", "SHA256withRSA"),
        ("paypal-cert-url", "https://api.paypal.test/certs/cert.pem"),
        ("paypal-transmission-id", "69cd13f0-d67a-11e5-baa3-778b53f4ae55"),
        ("paypal-transmission-sig", "c2lnbmF0dXJl"),
        ("paypal-transmission-time", "2026-10-16T10:00:00Z"),
    ]
}

pub fn stk_success_callback(checkout_request_id: &str, amount: i64, receipt: &str) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": amount },
                        { "Name": "MpesaReceiptNumber", "Value": receipt },
                        { "Name": "Balance" },
                        { "Name": "TransactionDate", "Value": 20261016102115_i64 },
                        { "Name": "PhoneNumber", "Value": 254712345678_i64 }
                    ]
                }
            }
        }
    })
}

pub fn stk_failure_callback(checkout_request_id: &str, code: i64) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": code,
                "ResultDesc": "Request cancelled by user"
            }
        }
    })
}

pub fn usd(minor_units: i64) -> Money {
    Money::new(minor_units, "USD")
}

/// A throwaway MongoDB database holding both stores.
pub struct MongoTestDb {
    pub db: mongodb::Database,
    pub ledger: Arc<MongoPaymentLedger>,
    pub entitlements: Arc<MongoEntitlementStore>,
}

impl MongoTestDb {
    pub async fn connect() -> Self {
        let uri = std::env::var("TEST_MONGODB_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let client = mongodb::Client::with_uri_str(&uri)
            .await
            .expect("Failed to connect to MongoDB");
        let db = client.database(&format!("premium_test_{}", uuid::Uuid::new_v4()));

        let ledger = Arc::new(MongoPaymentLedger::new(&db));
        ledger
            .init_indexes()
            .await
            .expect("Failed to create ledger indexes");
        let entitlements = Arc::new(MongoEntitlementStore::new(&db));
        entitlements
            .init_indexes()
            .await
            .expect("Failed to create entitlement indexes");

        Self {
            db,
            ledger,
            entitlements,
        }
    }

    /// Inserts a user record the way the account service stores them.
    pub async fn insert_user(&self) -> String {
        let id = mongodb::bson::oid::ObjectId::new();
        self.db
            .collection::<mongodb::bson::Document>("users")
            .insert_one(
                mongodb::bson::doc! { "_id": id, "email": "ada@example.com", "isPremium": false },
                None,
            )
            .await
            .expect("Failed to insert user");
        id.to_hex()
    }

    /// Cleanup test database after test completes.
    pub async fn cleanup(&self) {
        self.db
            .drop(None)
            .await
            .expect("Failed to drop test database");
    }
}
