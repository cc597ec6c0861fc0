//! Integration tests for the NeuroCal HTTP API
//!
//! The router is built over a lazy pool pointing at a closed port, so these
//! tests cover everything that is decided before the database is touched:
//! authentication, input validation, webhook verification and OAuth redirects.

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use common::{body_to_json, bearer_for, get_request, json_request, test_config};
use neurocal_server::config::OAuthCredentials;
use neurocal_server::security::issue_jwt;
use neurocal_server::{router, AppState, Config};

const TEST_WEBHOOK_SECRET: &str = "whsec_test";

// =============================================================================
// Test Helpers
// =============================================================================

fn create_test_app(config: Config) -> Router {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(1))
        .connect_lazy(&config.database_url)
        .expect("Failed to build lazy pool");

    router(AppState::new(pool, config))
}

fn bearer() -> String {
    bearer_for(Uuid::new_v4(), "ada@example.com")
}

fn stripe_signature(payload: &str, secret: &str, timestamp: i64) -> String {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

fn webhook_request(payload: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(signature) = signature {
        builder = builder.header("stripe-signature", signature);
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_reports_unreachable_database() {
    let app = create_test_app(test_config());

    let response = app.oneshot(get_request("/health", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["database"], "disconnected");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_protected_routes_require_token() {
    let app = create_test_app(test_config());

    for uri in [
        "/api/auth/me",
        "/api/users/profile",
        "/api/calendar/events",
        "/api/calendar/stats",
        "/api/sync/status",
        "/api/billing/subscription",
        "/api/billing/usage",
        "/api/crm/contacts",
        "/api/crm/dashboard",
    ] {
        let response = app.clone().oneshot(get_request(uri, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);

        let body = body_to_json(response.into_body()).await;
        assert_eq!(body["error"], "Unauthorized", "{}", uri);
    }
}

#[tokio::test]
async fn test_token_signed_with_other_secret_is_rejected() {
    let app = create_test_app(test_config());
    let forged = issue_jwt(Uuid::new_v4(), "eve@example.com", "some-other-secret").unwrap();

    let response = app
        .oneshot(get_request(
            "/api/users/profile",
            Some(&format!("Bearer {}", forged)),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_authorization_header() {
    let app = create_test_app(test_config());

    for auth in ["Bearer ", "Basic dXNlcjpwYXNz", "Bearer not.a.jwt"] {
        let response = app
            .clone()
            .oneshot(get_request("/api/auth/me", Some(auth)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", auth);
    }
}

// =============================================================================
// Input validation
// =============================================================================

#[tokio::test]
async fn test_register_rejects_bad_input() {
    let app = create_test_app(test_config());

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/register",
            None,
            json!({"email": "not-an-email", "password": "long enough password"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/auth/register",
            None,
            json!({"email": "ada@example.com", "password": "short"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_to_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("at least 8"));
}

#[tokio::test]
async fn test_create_event_rejects_inverted_range() {
    let app = create_test_app(test_config());
    let auth = bearer();

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/calendar/events",
            Some(&auth),
            json!({
                "title": "Standup",
                "start_time": "2025-03-01T10:00:00Z",
                "end_time": "2025-03-01T09:00:00Z"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_to_json(response.into_body()).await;
    assert_eq!(body["error"], "end_time must be after start_time");
}

#[tokio::test]
async fn test_create_event_rejects_blank_title() {
    let app = create_test_app(test_config());
    let auth = bearer();

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/calendar/events",
            Some(&auth),
            json!({
                "title": "   ",
                "start_time": "2025-03-01T09:00:00Z",
                "end_time": "2025-03-01T10:00:00Z"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_search_requires_query() {
    let app = create_test_app(test_config());
    let auth = bearer();

    let response = app
        .oneshot(get_request("/api/calendar/events/search?q=%20", Some(&auth)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_crm_rejects_unknown_values() {
    let app = create_test_app(test_config());
    let auth = bearer();

    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/api/crm/deals/{}/stage", Uuid::new_v4()),
            Some(&auth),
            json!({"stage": "won"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_to_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("closed_won"));

    let response = app
        .oneshot(get_request("/api/crm/leads?status=hot", Some(&auth)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Stripe webhooks
// =============================================================================

#[tokio::test]
async fn test_webhook_unconfigured() {
    let app = create_test_app(test_config());

    let response = app
        .oneshot(webhook_request("{}", Some("t=1,v1=00".to_string())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_webhook_signature_checks() {
    let mut config = test_config();
    config.stripe_webhook_secret = Some(TEST_WEBHOOK_SECRET.to_string());
    let app = create_test_app(config);
    let payload = r#"{"id":"evt_1","type":"invoice.payment_succeeded","data":{"object":{}}}"#;
    let now = chrono::Utc::now().timestamp();

    // Missing header
    let response = app
        .clone()
        .oneshot(webhook_request(payload, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Wrong secret
    let response = app
        .clone()
        .oneshot(webhook_request(
            payload,
            Some(stripe_signature(payload, "whsec_other", now)),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Correct secret, stale timestamp
    let response = app
        .oneshot(webhook_request(
            payload,
            Some(stripe_signature(payload, TEST_WEBHOOK_SECRET, now - 3600)),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_rejects_signed_garbage() {
    let mut config = test_config();
    config.stripe_webhook_secret = Some(TEST_WEBHOOK_SECRET.to_string());
    let app = create_test_app(config);
    let payload = "not json";
    let signature = stripe_signature(payload, TEST_WEBHOOK_SECRET, chrono::Utc::now().timestamp());

    let response = app
        .oneshot(webhook_request(payload, Some(signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// OAuth sign-in
// =============================================================================

#[tokio::test]
async fn test_oauth_unknown_provider() {
    let app = create_test_app(test_config());

    let response = app
        .oneshot(get_request("/api/auth/oauth/myspace", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_oauth_unconfigured_provider() {
    let app = create_test_app(test_config());

    let response = app
        .oneshot(get_request("/api/auth/oauth/google", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_oauth_redirects_to_consent_page() {
    let mut config = test_config();
    config.google = Some(OAuthCredentials {
        client_id: "client-123".to_string(),
        client_secret: "secret".to_string(),
    });
    let app = create_test_app(config);

    let response = app
        .oneshot(get_request("/api/auth/oauth/google", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
    assert!(location.contains("client_id=client-123"));
    assert!(location.contains("state="));

    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cookie.starts_with("neurocal_oauth_nonce="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Max-Age=600"));
}

#[tokio::test]
async fn test_oauth_callback_error_returns_to_frontend() {
    let mut config = test_config();
    config.google = Some(OAuthCredentials {
        client_id: "client-123".to_string(),
        client_secret: "secret".to_string(),
    });
    let app = create_test_app(config);

    let response = app
        .oneshot(get_request(
            "/api/auth/oauth/google/callback?error=access_denied",
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers().get(header::LOCATION).unwrap();
    assert_eq!(
        location,
        "http://localhost:5173/auth/callback?error=oauth_failed"
    );
    let cookie = response.headers().get(header::SET_COOKIE).unwrap();
    assert!(cookie.to_str().unwrap().contains("Max-Age=0"));
}

// =============================================================================
// Unconfigured integrations
// =============================================================================

#[tokio::test]
async fn test_ai_unconfigured() {
    let app = create_test_app(test_config());
    let auth = bearer();

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/ai/parse-event",
            Some(&auth),
            json!({"text": "Lunch with Sam tomorrow at noon"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_sync_auth_url_checks_provider() {
    let app = create_test_app(test_config());
    let auth = bearer();

    let response = app
        .clone()
        .oneshot(get_request("/api/sync/myspace/auth-url", Some(&auth)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(get_request("/api/sync/google/auth-url", Some(&auth)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
