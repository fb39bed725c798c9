mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use premium_service::config::ProviderHttpConfig;
use premium_service::models::{AttemptState, Channel, Outcome, Plan, Provider, UserEntitlement};
use premium_service::services::premium::{CANCELLED_BY_PAYER, CHARGE_NOT_STARTED};
use premium_service::services::reconciler::AMOUNT_MISMATCH;
use premium_service::services::EntitlementStore;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

async fn post_paypal_event(app: &TestApp, event: &Value) -> StatusCode {
    let mut request = app
        .client
        .post(format!("{}/webhooks/paypal", app.address))
        .header("content-type", "application/json")
        .body(event.to_string());
    for (name, value) in paypal_webhook_headers() {
        request = request.header(name, value);
    }
    request.send().await.expect("Failed to post webhook").status()
}

async fn post_mpesa_callback(app: &TestApp, token: &str, body: &Value) -> StatusCode {
    app.client
        .post(format!(
            "{}/webhooks/mpesa?token={}",
            app.address,
            urlencoding::encode(token)
        ))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .expect("Failed to post callback")
        .status()
}

#[tokio::test]
async fn paypal_checkout_and_capture_grants_premium_once() {
    let app = TestApp::spawn().await;
    mount_paypal_token(&app.paypal).await;
    mount_paypal_create(&app.paypal, "ORDER-1").await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders/ORDER-1/capture"))
        .and(header("PayPal-Request-Id", "capture-ORDER-1"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(completed_order("ORDER-1", "CAP-1", "9.99")),
        )
        .expect(1)
        .mount(&app.paypal)
        .await;

    let response = app
        .post(TEST_USER_ID, "/premium/checkout")
        .json(&json!({ "plan": "monthly", "provider": "paypal" }))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::CREATED);

    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["provider_reference"], "ORDER-1");
    assert_eq!(body["amount"], "9.99");
    assert_eq!(body["currency"], "USD");
    assert_eq!(body["action"]["type"], "redirect");
    assert!(body["action"]["url"]
        .as_str()
        .unwrap()
        .contains("checkoutnow?token=ORDER-1"));

    let response = app
        .post(TEST_USER_ID, "/premium/paypal/capture")
        .json(&json!({ "order_id": "ORDER-1" }))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["success"], true);
    assert_eq!(body["state"], "completed");

    let attempts = app.ledger.all().await;
    assert_eq!(attempts.len(), 1);
    let attempt = &attempts[0];
    assert_eq!(attempt.state, AttemptState::Completed);
    assert!(attempt.entitlement_applied);
    assert_eq!(attempt.provider_receipt_id.as_deref(), Some("CAP-1"));
    assert_eq!(
        attempt.metadata.get("payer_email").map(String::as_str),
        Some("payer@example.com")
    );

    let entitlement = app.entitlements.get(TEST_USER_ID).await.unwrap().unwrap();
    assert!(entitlement.is_active_at(Utc::now()));
    assert_eq!(entitlement.premium_grants, vec![attempt.id.to_string()]);
}

#[tokio::test]
async fn immediate_status_poll_after_checkout_completes_single_row() {
    let app = TestApp::spawn().await;
    mount_paypal_token(&app.paypal).await;
    mount_paypal_create(&app.paypal, "ORDER-FAST").await;
    Mock::given(method("GET"))
        .and(path("/v2/checkout/orders/ORDER-FAST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completed_order("ORDER-FAST", "CAP-FAST", "9.99")),
        )
        .mount(&app.paypal)
        .await;

    let started = app
        .service
        .initiate_charge(TEST_USER_ID, Plan::Monthly, Provider::Paypal, None)
        .await
        .expect("checkout failed");

    let polled = app
        .service
        .poll_and_reconcile_once(started.attempt_id)
        .await
        .expect("poll failed");
    assert_eq!(polled.state, AttemptState::Completed);

    // A second poll is a no-op.
    app.service
        .poll_and_reconcile_once(started.attempt_id)
        .await
        .expect("poll failed");

    assert_eq!(app.ledger.all().await.len(), 1);
    let entitlement = app.entitlements.get(TEST_USER_ID).await.unwrap().unwrap();
    assert_eq!(entitlement.premium_grants.len(), 1);
}

#[tokio::test]
async fn duplicate_webhooks_and_poll_extend_entitlement_once() {
    let app = TestApp::spawn().await;
    mount_paypal_token(&app.paypal).await;
    mount_paypal_verification(&app.paypal, "SUCCESS").await;
    Mock::given(method("GET"))
        .and(path("/v2/checkout/orders/ORDER-DUP"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completed_order("ORDER-DUP", "CAP-DUP", "9.99")),
        )
        .mount(&app.paypal)
        .await;

    let id = app
        .seed_pending(Provider::Paypal, Plan::Monthly, "ORDER-DUP", ChronoDuration::zero())
        .await;
    let event = capture_completed_event("ORDER-DUP", "CAP-DUP", "9.99");

    assert_eq!(post_paypal_event(&app, &event).await, StatusCode::OK);
    assert_eq!(post_paypal_event(&app, &event).await, StatusCode::OK);

    let response = app
        .get(TEST_USER_ID, &format!("/premium/payments/{}/status", id))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["state"], "completed");

    let entitlement = app.entitlements.get(TEST_USER_ID).await.unwrap().unwrap();
    assert_eq!(entitlement.premium_grants.len(), 1);
    let expires = entitlement.premium_expires_at.expect("expiry missing");
    assert!(expires < Utc::now() + ChronoDuration::days(32));
}

#[tokio::test]
async fn concurrent_callbacks_grant_once() {
    let app = TestApp::spawn().await;
    let id = app
        .seed_pending(Provider::Mpesa, Plan::Monthly, "ws_CO_RACE", ChronoDuration::zero())
        .await;
    let callback = stk_success_callback("ws_CO_RACE", 1299, "RACE123");

    let (first, second, third) = tokio::join!(
        post_mpesa_callback(&app, MPESA_CALLBACK_SECRET, &callback),
        post_mpesa_callback(&app, MPESA_CALLBACK_SECRET, &callback),
        post_mpesa_callback(&app, MPESA_CALLBACK_SECRET, &callback),
    );
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(third, StatusCode::OK);

    let attempt = app.attempt(id).await;
    assert_eq!(attempt.state, AttemptState::Completed);
    assert_eq!(attempt.provider_receipt_id.as_deref(), Some("RACE123"));
    assert!(attempt.entitlement_applied);

    let entitlement = app.entitlements.get(TEST_USER_ID).await.unwrap().unwrap();
    assert_eq!(entitlement.premium_grants.len(), 1);
}

#[tokio::test]
async fn purchase_stacks_on_remaining_premium_time() {
    let app = TestApp::spawn().await;
    let current_expiry = Utc::now() + ChronoDuration::days(10);
    app.entitlements
        .seed(UserEntitlement {
            user_id: TEST_USER_ID.to_string(),
            is_premium: true,
            premium_expires_at: Some(current_expiry),
            premium_grants: Vec::new(),
        })
        .await;
    app.seed_pending(Provider::Paypal, Plan::Monthly, "ORDER-STACK", ChronoDuration::zero())
        .await;

    app.service
        .reconciler()
        .apply(
            Provider::Paypal,
            Outcome::Success {
                provider_reference: "ORDER-STACK".to_string(),
                receipt_id: Some("CAP-STACK".to_string()),
                amount_confirmed: Some(usd(999)),
                metadata: BTreeMap::new(),
            },
            Channel::Capture,
        )
        .await
        .expect("apply failed");

    let entitlement = app.entitlements.get(TEST_USER_ID).await.unwrap().unwrap();
    assert_eq!(
        entitlement.premium_expires_at,
        Some(Plan::Monthly.extend_from(current_expiry))
    );
}

#[tokio::test]
async fn tampered_amount_is_flagged_and_grants_nothing() {
    let app = TestApp::spawn().await;
    mount_paypal_token(&app.paypal).await;
    mount_paypal_verification(&app.paypal, "SUCCESS").await;
    let id = app
        .seed_pending(Provider::Paypal, Plan::Annual, "ORDER-TAMPER", ChronoDuration::zero())
        .await;

    let event = capture_completed_event("ORDER-TAMPER", "CAP-TAMPER", "0.01");
    assert_eq!(post_paypal_event(&app, &event).await, StatusCode::OK);

    let attempt = app.attempt(id).await;
    assert_eq!(attempt.state, AttemptState::Failed);
    assert_eq!(attempt.failure_reason.as_deref(), Some(AMOUNT_MISMATCH));
    assert!(attempt.flagged_for_audit);
    assert_eq!(attempt.provider_receipt_id, None);
    assert_eq!(
        attempt.metadata.get("provider_receipt_id").map(String::as_str),
        Some("CAP-TAMPER")
    );
    assert_eq!(
        attempt.metadata.get("confirmed_amount").map(String::as_str),
        Some("0.01 USD")
    );
    assert!(app.entitlements.get(TEST_USER_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn provider_timeout_never_fails_an_attempt() {
    let app = TestApp::spawn_with(ProviderHttpConfig {
        request_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_millis(200),
        charge_retry_max_elapsed: Duration::from_millis(100),
    })
    .await;
    mount_paypal_token(&app.paypal).await;
    Mock::given(method("GET"))
        .and(path("/v2/checkout/orders/ORDER-SLOW"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completed_order("ORDER-SLOW", "CAP-SLOW", "9.99"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&app.paypal)
        .await;

    let id = app
        .seed_pending(Provider::Paypal, Plan::Monthly, "ORDER-SLOW", ChronoDuration::zero())
        .await;

    let response = app
        .get(TEST_USER_ID, &format!("/premium/payments/{}/status", id))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["state"], "pending");
    assert_eq!(app.attempt(id).await.state, AttemptState::Pending);

    // The provider recovers; the next poll settles the attempt.
    app.paypal.reset().await;
    mount_paypal_token(&app.paypal).await;
    Mock::given(method("GET"))
        .and(path("/v2/checkout/orders/ORDER-SLOW"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completed_order("ORDER-SLOW", "CAP-SLOW", "9.99")),
        )
        .mount(&app.paypal)
        .await;

    let attempt = app
        .service
        .poll_and_reconcile_once(id)
        .await
        .expect("poll failed");
    assert_eq!(attempt.state, AttemptState::Completed);
    assert!(app.service.is_premium_active(TEST_USER_ID).await.unwrap());
}

#[tokio::test]
async fn charge_that_cannot_start_leaves_failed_attempt() {
    let app = TestApp::spawn().await;
    mount_paypal_token(&app.paypal).await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&app.paypal)
        .await;

    let response = app
        .post(TEST_USER_ID, "/premium/checkout")
        .json(&json!({ "plan": "monthly", "provider": "paypal" }))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let attempts = app.ledger.all().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, AttemptState::Failed);
    assert_eq!(attempts[0].failure_reason.as_deref(), Some(CHARGE_NOT_STARTED));
    assert!(attempts[0].provider_reference.is_none());
}

#[tokio::test]
async fn invalid_callbacks_are_rejected_without_changes() {
    let app = TestApp::spawn().await;
    mount_paypal_token(&app.paypal).await;
    mount_paypal_verification(&app.paypal, "FAILURE").await;

    let paypal_id = app
        .seed_pending(Provider::Paypal, Plan::Monthly, "ORDER-FORGED", ChronoDuration::zero())
        .await;
    let mpesa_id = app
        .seed_pending(Provider::Mpesa, Plan::Monthly, "ws_CO_FORGED", ChronoDuration::zero())
        .await;

    let event = capture_completed_event("ORDER-FORGED", "CAP-FORGED", "9.99");
    assert_eq!(post_paypal_event(&app, &event).await, StatusCode::UNAUTHORIZED);

    let callback = stk_success_callback("ws_CO_FORGED", 1299, "FORGED1");
    assert_eq!(
        post_mpesa_callback(&app, "wrong-secret", &callback).await,
        StatusCode::UNAUTHORIZED
    );

    assert_eq!(app.attempt(paypal_id).await.state, AttemptState::Pending);
    assert_eq!(app.attempt(mpesa_id).await.state, AttemptState::Pending);
    assert!(app.entitlements.get(TEST_USER_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn unverifiable_paypal_webhook_is_acknowledged_but_not_applied() {
    let app = TestApp::spawn().await;
    mount_paypal_token(&app.paypal).await;
    Mock::given(method("POST"))
        .and(path("/v1/notifications/verify-webhook-signature"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&app.paypal)
        .await;

    let id = app
        .seed_pending(Provider::Paypal, Plan::Monthly, "ORDER-LATER", ChronoDuration::zero())
        .await;
    let event = capture_completed_event("ORDER-LATER", "CAP-LATER", "9.99");

    assert_eq!(post_paypal_event(&app, &event).await, StatusCode::OK);
    assert_eq!(app.attempt(id).await.state, AttemptState::Pending);
    assert!(app.entitlements.get(TEST_USER_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn callback_for_unknown_reference_is_acknowledged() {
    let app = TestApp::spawn().await;
    let callback = stk_success_callback("ws_CO_NOBODY", 1299, "NOBODY1");

    assert_eq!(
        post_mpesa_callback(&app, MPESA_CALLBACK_SECRET, &callback).await,
        StatusCode::OK
    );
    assert!(app.ledger.all().await.is_empty());
    assert!(app.entitlements.get(TEST_USER_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn payer_cancelling_stk_prompt_cancels_attempt() {
    let app = TestApp::spawn().await;
    let id = app
        .seed_pending(Provider::Mpesa, Plan::Monthly, "ws_CO_CANCEL", ChronoDuration::zero())
        .await;

    let callback = stk_failure_callback("ws_CO_CANCEL", 1032);
    assert_eq!(
        post_mpesa_callback(&app, MPESA_CALLBACK_SECRET, &callback).await,
        StatusCode::OK
    );

    let attempt = app.attempt(id).await;
    assert_eq!(attempt.state, AttemptState::Cancelled);
    assert_eq!(attempt.failure_reason.as_deref(), Some("CANCELLED_BY_USER"));
}

#[tokio::test]
async fn late_success_after_failure_is_discarded() {
    let app = TestApp::spawn().await;
    let id = app
        .seed_pending(Provider::Mpesa, Plan::Monthly, "ws_CO_LATE", ChronoDuration::zero())
        .await;

    let failed = stk_failure_callback("ws_CO_LATE", 2001);
    assert_eq!(
        post_mpesa_callback(&app, MPESA_CALLBACK_SECRET, &failed).await,
        StatusCode::OK
    );
    let success = stk_success_callback("ws_CO_LATE", 1299, "LATE123");
    assert_eq!(
        post_mpesa_callback(&app, MPESA_CALLBACK_SECRET, &success).await,
        StatusCode::OK
    );

    let attempt = app.attempt(id).await;
    assert_eq!(attempt.state, AttemptState::Failed);
    assert_eq!(attempt.failure_reason.as_deref(), Some("MPESA_RESULT_2001"));
    assert!(app.entitlements.get(TEST_USER_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn paypal_cancel_return_cancels_pending_attempt() {
    let app = TestApp::spawn().await;
    let id = app
        .seed_pending(Provider::Paypal, Plan::Monthly, "ORDER-BACK", ChronoDuration::zero())
        .await;

    let response = app
        .get(OTHER_USER_ID, "/premium/paypal/cancel?token=ORDER-BACK")
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .get(TEST_USER_ID, "/premium/paypal/cancel?token=ORDER-BACK")
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["state"], "cancelled");

    let attempt = app.attempt(id).await;
    assert_eq!(attempt.state, AttemptState::Cancelled);
    assert_eq!(attempt.failure_reason.as_deref(), Some(CANCELLED_BY_PAYER));
}
