use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

use crate::billing::webhook::{handle_event, StripeEvent, WebhookOutcome};
use crate::error::{AppError, Result};
use crate::security::verify_stripe_signature;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/stripe", post(stripe_webhook))
}

/// Receive a Stripe webhook
///
/// The body is verified against `Stripe-Signature` before it is parsed.
/// Once verified the delivery is always acknowledged; processing failures
/// are only logged.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .ok_or(AppError::NotConfigured("Stripe webhooks"))?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook without signature header");
            AppError::InvalidSignature
        })?;

    if !verify_stripe_signature(&body, signature, secret) {
        tracing::warn!("Stripe webhook signature verification failed");
        return Err(AppError::InvalidSignature);
    }

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidInput(format!("Invalid event payload: {}", e)))?;

    tracing::info!("Stripe event {} ({})", event.id, event.event_type);

    match handle_event(&state.pool, &event).await {
        Ok(WebhookOutcome::Duplicate) => Ok(Json(json!({"received": true, "duplicate": true}))),
        Ok(WebhookOutcome::Processed) => Ok(Json(json!({"received": true}))),
        Err(e) => {
            tracing::error!("Failed to process Stripe event {}: {}", event.id, e);
            Ok(Json(json!({"received": true})))
        }
    }
}
