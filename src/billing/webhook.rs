//! Stripe webhook events mirrored into local billing state

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::stripe::StripeSubscription;
use crate::error::{AppError, Result};
use crate::models::SubscriptionStatus;

/// Envelope of every webhook delivery
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

/// Subset of a Stripe invoice object
#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub description: Option<String>,
    pub hosted_invoice_url: Option<String>,
}

fn default_currency() -> String {
    "usd".to_string()
}

/// What a delivery did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

fn object<T: serde::de::DeserializeOwned>(event: &StripeEvent) -> Result<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        AppError::InvalidInput(format!("Malformed {} payload: {}", event.event_type, e))
    })
}

/// Record the event id; false when it was already processed
async fn claim(pool: &PgPool, event: &StripeEvent) -> Result<bool> {
    let claimed = sqlx::query(
        r#"
        INSERT INTO stripe_webhook_events (id, event_type)
        VALUES ($1, $2)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(&event.id)
    .bind(&event.event_type)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(claimed == 1)
}

/// Apply a verified webhook event, at most once per event id
pub async fn handle_event(pool: &PgPool, event: &StripeEvent) -> Result<WebhookOutcome> {
    if !claim(pool, event).await? {
        tracing::info!("Ignoring duplicate Stripe event {}", event.id);
        return Ok(WebhookOutcome::Duplicate);
    }

    match event.event_type.as_str() {
        "invoice.payment_succeeded" => {
            let invoice: StripeInvoice = object(event)?;
            record_invoice(pool, &invoice, "paid", invoice.amount_paid).await?;
            set_status_by_subscription(pool, invoice.subscription.as_deref(), SubscriptionStatus::Active)
                .await?;
        }
        "invoice.payment_failed" => {
            let invoice: StripeInvoice = object(event)?;
            record_invoice(pool, &invoice, "failed", invoice.amount_due).await?;
            set_status_by_subscription(pool, invoice.subscription.as_deref(), SubscriptionStatus::PastDue)
                .await?;
        }
        "customer.subscription.updated" => {
            let subscription: StripeSubscription = object(event)?;
            mirror_subscription(pool, &subscription).await?;
        }
        "customer.subscription.deleted" => {
            let subscription: StripeSubscription = object(event)?;
            set_status_by_subscription(pool, Some(subscription.id.as_str()), SubscriptionStatus::Canceled)
                .await?;
        }
        "customer.subscription.trial_will_end" => {
            let subscription: StripeSubscription = object(event)?;
            tracing::info!(
                "Trial ending soon for Stripe subscription {} (ends {:?})",
                subscription.id,
                timestamp(subscription.trial_end)
            );
        }
        other => {
            tracing::debug!("Unhandled Stripe event type: {}", other);
        }
    }

    Ok(WebhookOutcome::Processed)
}

async fn user_for_customer(pool: &PgPool, customer_id: &str) -> Result<Option<Uuid>> {
    let user_id = sqlx::query_scalar(
        r#"
        SELECT id FROM users WHERE stripe_customer_id = $1
        UNION
        SELECT user_id FROM user_subscriptions WHERE stripe_customer_id = $1
        LIMIT 1
        "#,
    )
    .bind(customer_id)
    .fetch_optional(pool)
    .await?;

    Ok(user_id)
}

async fn record_invoice(
    pool: &PgPool,
    invoice: &StripeInvoice,
    status: &str,
    amount_cents: i64,
) -> Result<()> {
    let Some(customer_id) = invoice.customer.as_deref() else {
        tracing::warn!("Invoice {} has no customer", invoice.id);
        return Ok(());
    };
    let Some(user_id) = user_for_customer(pool, customer_id).await? else {
        tracing::warn!("Invoice {} for unknown customer {}", invoice.id, customer_id);
        return Ok(());
    };

    sqlx::query(
        r#"
        INSERT INTO billing_history
            (id, user_id, stripe_invoice_id, amount_cents, currency, status, description, invoice_url)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (stripe_invoice_id) DO UPDATE
        SET status = EXCLUDED.status, amount_cents = EXCLUDED.amount_cents
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(&invoice.id)
    .bind(amount_cents)
    .bind(&invoice.currency)
    .bind(status)
    .bind(&invoice.description)
    .bind(&invoice.hosted_invoice_url)
    .execute(pool)
    .await?;

    tracing::info!("Invoice {} {} for user {}", invoice.id, status, user_id);
    Ok(())
}

async fn set_status_by_subscription(
    pool: &PgPool,
    subscription_id: Option<&str>,
    status: SubscriptionStatus,
) -> Result<()> {
    let Some(subscription_id) = subscription_id else {
        return Ok(());
    };

    let updated = sqlx::query(
        r#"
        UPDATE user_subscriptions
        SET status = $1, updated_at = NOW()
        WHERE stripe_subscription_id = $2
        "#,
    )
    .bind(status.as_str())
    .bind(subscription_id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        tracing::warn!("No local subscription for Stripe subscription {}", subscription_id);
    } else {
        tracing::info!("Subscription {} is now {}", subscription_id, status.as_str());
    }
    Ok(())
}

/// Copy status, period and cancellation flag from a Stripe subscription
async fn mirror_subscription(pool: &PgPool, subscription: &StripeSubscription) -> Result<()> {
    let status = SubscriptionStatus::from_stripe(&subscription.status);
    if status.is_none() {
        tracing::debug!(
            "Stripe status {} has no local counterpart; keeping status of {}",
            subscription.status,
            subscription.id
        );
    }

    let updated = sqlx::query(
        r#"
        UPDATE user_subscriptions
        SET status = COALESCE($1, status),
            current_period_start = COALESCE($2, current_period_start),
            current_period_end = COALESCE($3, current_period_end),
            trial_end_date = COALESCE($4, trial_end_date),
            cancel_at_period_end = $5,
            updated_at = NOW()
        WHERE stripe_subscription_id = $6
        "#,
    )
    .bind(status.map(|s| s.as_str()))
    .bind(timestamp(subscription.current_period_start))
    .bind(timestamp(subscription.current_period_end))
    .bind(timestamp(subscription.trial_end))
    .bind(subscription.cancel_at_period_end)
    .bind(&subscription.id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        tracing::warn!("No local subscription for Stripe subscription {}", subscription.id);
    }
    Ok(())
}
