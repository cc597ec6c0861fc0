//! Outbound client tests against local mock servers
//!
//! Covers the calendar providers (paging, filtering, token refresh), the LLM
//! client and the Stripe client without reaching the real services.

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use neurocal_server::ai::{self, LlmClient};
use neurocal_server::billing::stripe::StripeClient;
use neurocal_server::config::OAuthCredentials;
use neurocal_server::error::AppError;
use neurocal_server::sync::{
    CalendarProvider, FetchWindow, GoogleCalendarProvider, OutlookCalendarProvider,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn credentials() -> Option<OAuthCredentials> {
    Some(OAuthCredentials {
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
    })
}

fn window() -> FetchWindow {
    let time_min = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
    FetchWindow {
        time_min,
        time_max: time_min + Duration::days(30),
    }
}

fn google(server: &MockServer) -> GoogleCalendarProvider {
    GoogleCalendarProvider::new(reqwest::Client::new(), credentials())
        .with_endpoints(&server.uri(), &format!("{}/token", server.uri()))
}

fn outlook(server: &MockServer) -> OutlookCalendarProvider {
    OutlookCalendarProvider::new(reqwest::Client::new(), credentials(), "common")
        .with_endpoints(&server.uri(), &format!("{}/token", server.uri()))
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    })
}

// =============================================================================
// Google Calendar
// =============================================================================

#[tokio::test]
async fn test_google_pages_through_events() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/calendars/primary/events"))
        .and(header("authorization", "Bearer access-1"))
        .and(query_param("singleEvents", "true"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": "g-1",
                    "summary": "Planning",
                    "start": {"dateTime": "2025-03-03T09:00:00+01:00"},
                    "end": {"dateTime": "2025-03-03T10:00:00+01:00"},
                    "attendees": [
                        {"email": "sam@example.com", "displayName": "Sam", "responseStatus": "accepted"}
                    ]
                },
                {
                    "id": "g-2",
                    "status": "cancelled",
                    "start": {"dateTime": "2025-03-04T09:00:00Z"},
                    "end": {"dateTime": "2025-03-04T10:00:00Z"}
                }
            ],
            "nextPageToken": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/calendars/primary/events"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": "g-3",
                    "summary": "Offsite",
                    "start": {"date": "2025-03-10"},
                    "end": {"date": "2025-03-11"}
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = google(&server);

    let first = provider
        .fetch_events("access-1", "primary", window(), None)
        .await
        .unwrap();
    assert_eq!(first.events.len(), 1);
    assert_eq!(first.events[0].external_id, "g-1");
    assert_eq!(
        first.events[0].start_time,
        Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap()
    );
    assert_eq!(first.events[0].attendees[0].email, "sam@example.com");
    assert_eq!(first.next_page.as_deref(), Some("page-2"));

    let second = provider
        .fetch_events("access-1", "primary", window(), first.next_page.as_deref())
        .await
        .unwrap();
    assert_eq!(second.events.len(), 1);
    assert!(second.events[0].all_day);
    assert!(second.next_page.is_none());
}

#[tokio::test]
async fn test_google_api_error_is_upstream() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/calendars/primary/events"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
        .mount(&server)
        .await;

    let result = google(&server)
        .fetch_events("expired", "primary", window(), None)
        .await;

    assert!(matches!(result, Err(AppError::Upstream(msg)) if msg.contains("401")));
}

#[tokio::test]
async fn test_google_refresh_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .and(body_string_contains("client_id=client-id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-2",
            "expires_in": 3599,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = google(&server).refresh_token("refresh-1").await.unwrap();

    assert_eq!(tokens.access_token, "access-2");
    assert_eq!(tokens.expires_in, Some(3599));
    assert!(tokens.refresh_token.is_none());
}

#[tokio::test]
async fn test_refresh_without_credentials() {
    let server = MockServer::start().await;
    let provider = GoogleCalendarProvider::new(reqwest::Client::new(), None)
        .with_endpoints(&server.uri(), &format!("{}/token", server.uri()));

    let result = provider.refresh_token("refresh-1").await;

    assert!(matches!(result, Err(AppError::NotConfigured(_))));
}

// =============================================================================
// Outlook
// =============================================================================

#[tokio::test]
async fn test_outlook_follows_next_link() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me/calendarView"))
        .and(header("authorization", "Bearer graph-token"))
        .and(header("prefer", r#"outlook.timezone="UTC""#))
        .and(query_param("$top", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {
                    "id": "o-1",
                    "subject": "1:1",
                    "bodyPreview": "Weekly catch-up",
                    "location": {"displayName": "Room 4"},
                    "start": {"dateTime": "2025-03-05T14:00:00.0000000", "timeZone": "UTC"},
                    "end": {"dateTime": "2025-03-05T14:30:00.0000000", "timeZone": "UTC"},
                    "attendees": [
                        {
                            "emailAddress": {"address": "kim@example.com", "name": "Kim"},
                            "status": {"response": "tentativelyAccepted"}
                        }
                    ]
                },
                {
                    "id": "o-2",
                    "subject": "Dropped",
                    "isCancelled": true,
                    "start": {"dateTime": "2025-03-06T14:00:00.0000000"},
                    "end": {"dateTime": "2025-03-06T15:00:00.0000000"}
                }
            ],
            "@odata.nextLink": format!("{}/next-page?$skip=50", server.uri())
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/next-page"))
        .and(query_param("$skip", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(1)
        .mount(&server)
        .await;

    let provider = outlook(&server);

    let first = provider
        .fetch_events("graph-token", "primary", window(), None)
        .await
        .unwrap();
    assert_eq!(first.events.len(), 1);
    let event = &first.events[0];
    assert_eq!(event.title, "1:1");
    assert_eq!(event.location.as_deref(), Some("Room 4"));
    assert_eq!(event.end_time - event.start_time, Duration::minutes(30));
    assert_eq!(event.attendees[0].status.as_deref(), Some("tentativelyAccepted"));

    let second = provider
        .fetch_events("graph-token", "primary", window(), first.next_page.as_deref())
        .await
        .unwrap();
    assert!(second.events.is_empty());
    assert!(second.next_page.is_none());
}

#[tokio::test]
async fn test_outlook_refresh_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "graph-2",
            "refresh_token": "rotated",
            "expires_in": 4000
        })))
        .mount(&server)
        .await;

    let tokens = outlook(&server).refresh_token("refresh-1").await.unwrap();

    assert_eq!(tokens.access_token, "graph-2");
    assert_eq!(tokens.refresh_token.as_deref(), Some("rotated"));
}

// =============================================================================
// LLM
// =============================================================================

#[tokio::test]
async fn test_parse_event_through_llm() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer llm-key"))
        .and(body_string_contains("json_object"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            "```json\n{\"title\": \"Lunch with Sam\", \"start_time\": \"2025-03-02T12:00:00Z\", \"location\": \"Cafe\"}\n```",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let llm = LlmClient::new(reqwest::Client::new(), &server.uri(), "llm-key", "test-model");
    let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();

    let parsed = ai::parse_event(&llm, "lunch with Sam tomorrow at noon", "UTC", now)
        .await
        .unwrap();

    assert_eq!(parsed.title, "Lunch with Sam");
    assert_eq!(parsed.location.as_deref(), Some("Cafe"));
    assert_eq!(parsed.end_time - parsed.start_time, Duration::hours(1));
}

#[tokio::test]
async fn test_suggest_times_through_llm() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"suggestions": [
                {"start_time": "2025-03-03T10:00:00Z", "reason": "Morning is free"},
                {"start_time": "not a time", "reason": "ignored"}
            ]}"#,
        )))
        .mount(&server)
        .await;

    let llm = LlmClient::new(reqwest::Client::new(), &server.uri(), "llm-key", "test-model");
    let start = Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap();

    let suggestions = ai::suggest_times(
        &llm,
        &[],
        Duration::minutes(45),
        (start, start + Duration::days(7)),
        "UTC",
        Some("mornings"),
    )
    .await
    .unwrap();

    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].end_time - suggestions[0].start_time, Duration::minutes(45));
    assert_eq!(suggestions[0].reason, "Morning is free");
}

#[tokio::test]
async fn test_llm_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer bad-key"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer llm-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Sure! Here you go.")))
        .mount(&server)
        .await;

    let rejected = LlmClient::new(reqwest::Client::new(), &server.uri(), "bad-key", "m");
    assert!(matches!(
        rejected.chat_json("system", "user").await,
        Err(AppError::Upstream(_))
    ));

    let chatty = LlmClient::new(reqwest::Client::new(), &server.uri(), "llm-key", "m");
    assert!(matches!(
        chatty.chat_json("system", "user").await,
        Err(AppError::AiResponse(_))
    ));
}

// =============================================================================
// Stripe
// =============================================================================

#[tokio::test]
async fn test_stripe_subscription_calls() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/subscriptions"))
        .and(header("authorization", "Bearer sk_test"))
        .and(body_string_contains("customer=cus_1"))
        .and(body_string_contains("trial_period_days=14"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sub_1",
            "status": "trialing",
            "customer": "cus_1",
            "current_period_start": 1740787200,
            "current_period_end": 1741996800,
            "trial_end": 1741996800,
            "cancel_at_period_end": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/subscriptions/sub_1"))
        .and(body_string_contains("cancel_at_period_end=true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sub_1",
            "status": "trialing",
            "cancel_at_period_end": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let stripe = StripeClient::new(reqwest::Client::new(), &server.uri(), "sk_test");

    let created = stripe
        .create_subscription("cus_1", "price_pro", 14)
        .await
        .unwrap();
    assert_eq!(created.id, "sub_1");
    assert_eq!(created.trial_end, Some(1741996800));

    let canceled = stripe.cancel_at_period_end("sub_1").await.unwrap();
    assert!(canceled.cancel_at_period_end);
}

#[tokio::test]
async fn test_stripe_error_is_upstream() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": {"message": "Your card was declined."}
        })))
        .mount(&server)
        .await;

    let stripe = StripeClient::new(reqwest::Client::new(), &server.uri(), "sk_test");
    let result = stripe.create_customer("ada@example.com", uuid::Uuid::new_v4()).await;

    assert!(matches!(result, Err(AppError::Upstream(msg)) if msg.contains("402")));
}
