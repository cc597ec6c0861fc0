use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::accounts::find_user;
use crate::auth::AuthUser;
use crate::billing::stripe::StripeClient;
use crate::billing::{effective_plan, usage};
use crate::constants::FREE_PLAN_ID;
use crate::error::{AppError, Result};
use crate::models::{BillingRecord, Plan, SubscriptionStatus, UsageRecord, UserSubscription};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/plans", get(list_plans))
        .route("/subscription", get(get_subscription))
        .route("/subscribe", post(subscribe))
        .route("/cancel", post(cancel))
        .route("/history", get(history))
        .route("/usage", get(get_usage))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    /// Plan whose limits apply right now
    pub plan: Plan,
    pub subscription: Option<UserSubscription>,
}

#[derive(Debug, Serialize)]
pub struct PlanLimits {
    pub max_events: Option<i32>,
    pub max_ai_requests: Option<i32>,
    pub max_calendar_syncs: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub plan_id: String,
    #[serde(flatten)]
    pub usage: UsageRecord,
    pub calendar_syncs: i64,
    pub limits: PlanLimits,
}

pub async fn list_plans(State(state): State<AppState>) -> Result<Json<Vec<Plan>>> {
    let plans = sqlx::query_as::<_, Plan>("SELECT * FROM subscription_plans ORDER BY price_cents")
        .fetch_all(&state.pool)
        .await?;

    Ok(Json(plans))
}

async fn find_subscription(state: &AppState, user_id: Uuid) -> Result<Option<UserSubscription>> {
    let subscription =
        sqlx::query_as::<_, UserSubscription>("SELECT * FROM user_subscriptions WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&state.pool)
            .await?;

    Ok(subscription)
}

pub async fn get_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<SubscriptionResponse>> {
    let plan = effective_plan(&state.pool, user.id).await?;
    let subscription = find_subscription(&state, user.id).await?;

    Ok(Json(SubscriptionResponse { plan, subscription }))
}

/// Switch to a plan
///
/// Paid plans go through Stripe. Moving between paid plans while a Stripe
/// subscription is live is refused; cancel first.
pub async fn subscribe(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<SubscribeRequest>,
) -> Result<Json<UserSubscription>> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM subscription_plans WHERE id = $1")
        .bind(payload.plan_id.trim())
        .fetch_optional(&state.pool)
        .await?
        .ok_or(AppError::NotFound("Plan"))?;

    if let Some(current) = find_subscription(&state, user.id).await? {
        let live = current.stripe_subscription_id.is_some()
            && SubscriptionStatus::grants_plan(&current.status);
        if live {
            return Err(AppError::Conflict(
                "Cancel the current subscription before changing plans".to_string(),
            ));
        }
    }

    if plan.id == FREE_PLAN_ID || plan.price_cents == 0 {
        let subscription = upsert_subscription(
            &state,
            SubscriptionRow {
                user_id: user.id,
                plan_id: &plan.id,
                status: SubscriptionStatus::Active,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                trial_end_date: None,
            },
        )
        .await?;
        tracing::info!("User {} moved to plan {}", user.id, plan.id);
        return Ok(Json(subscription));
    }

    let stripe = StripeClient::from_state(&state)?;
    let price_id = state
        .config
        .stripe_price_for(&plan.id)
        .or(plan.stripe_price_id.as_deref())
        .ok_or_else(|| {
            AppError::InvalidInput(format!("Plan {} is not available for purchase", plan.id))
        })?;

    let account = find_user(&state.pool, user.id).await?;
    let customer_id = match account.stripe_customer_id {
        Some(id) => id,
        None => {
            let customer = stripe.create_customer(&account.email, account.id).await?;
            sqlx::query("UPDATE users SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(&customer.id)
                .bind(user.id)
                .execute(&state.pool)
                .await?;
            customer.id
        }
    };

    let remote = stripe
        .create_subscription(&customer_id, price_id, plan.trial_days)
        .await?;

    let (status, trial_end_date) = if plan.trial_days > 0 {
        let trial_end = remote
            .trial_end
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .unwrap_or_else(|| Utc::now() + Duration::days(plan.trial_days as i64));
        (SubscriptionStatus::Trial, Some(trial_end))
    } else {
        (SubscriptionStatus::Active, None)
    };

    let subscription = upsert_subscription(
        &state,
        SubscriptionRow {
            user_id: user.id,
            plan_id: &plan.id,
            status,
            stripe_customer_id: Some(customer_id.as_str()),
            stripe_subscription_id: Some(remote.id.as_str()),
            trial_end_date,
        },
    )
    .await?;

    tracing::info!(
        "User {} subscribed to {} ({})",
        user.id,
        plan.id,
        status.as_str()
    );
    Ok(Json(subscription))
}

struct SubscriptionRow<'a> {
    user_id: Uuid,
    plan_id: &'a str,
    status: SubscriptionStatus,
    stripe_customer_id: Option<&'a str>,
    stripe_subscription_id: Option<&'a str>,
    trial_end_date: Option<chrono::DateTime<Utc>>,
}

async fn upsert_subscription(state: &AppState, row: SubscriptionRow<'_>) -> Result<UserSubscription> {
    let subscription = sqlx::query_as::<_, UserSubscription>(
        r#"
        INSERT INTO user_subscriptions
            (id, user_id, plan_id, status, stripe_customer_id, stripe_subscription_id, trial_end_date)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (user_id) DO UPDATE
        SET plan_id = EXCLUDED.plan_id,
            status = EXCLUDED.status,
            stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, user_subscriptions.stripe_customer_id),
            stripe_subscription_id = EXCLUDED.stripe_subscription_id,
            trial_end_date = EXCLUDED.trial_end_date,
            current_period_start = NULL,
            current_period_end = NULL,
            cancel_at_period_end = FALSE,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(row.user_id)
    .bind(row.plan_id)
    .bind(row.status.as_str())
    .bind(row.stripe_customer_id)
    .bind(row.stripe_subscription_id)
    .bind(row.trial_end_date)
    .fetch_one(&state.pool)
    .await?;

    Ok(subscription)
}

/// Cancel at the end of the paid period (immediately for unpaid plans)
pub async fn cancel(State(state): State<AppState>, user: AuthUser) -> Result<Json<UserSubscription>> {
    let current = find_subscription(&state, user.id)
        .await?
        .ok_or(AppError::NotFound("Subscription"))?;

    let updated = match current.stripe_subscription_id.as_deref() {
        Some(subscription_id) => {
            let stripe = StripeClient::from_state(&state)?;
            stripe.cancel_at_period_end(subscription_id).await?;

            sqlx::query_as::<_, UserSubscription>(
                r#"
                UPDATE user_subscriptions
                SET cancel_at_period_end = TRUE, updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(current.id)
            .fetch_one(&state.pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, UserSubscription>(
                r#"
                UPDATE user_subscriptions
                SET status = $1, updated_at = NOW()
                WHERE id = $2
                RETURNING *
                "#,
            )
            .bind(SubscriptionStatus::Canceled.as_str())
            .bind(current.id)
            .fetch_one(&state.pool)
            .await?
        }
    };

    tracing::info!("User {} canceled plan {}", user.id, updated.plan_id);
    Ok(Json(updated))
}

pub async fn history(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<BillingRecord>>> {
    let records = sqlx::query_as::<_, BillingRecord>(
        "SELECT * FROM billing_history WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(records))
}

pub async fn get_usage(State(state): State<AppState>, user: AuthUser) -> Result<Json<UsageResponse>> {
    let mut conn = state.pool.acquire().await?;

    let plan = effective_plan(&mut *conn, user.id).await?;
    let usage = usage::current_usage(&mut *conn, user.id).await?;
    let calendar_syncs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM calendar_syncs WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(&mut *conn)
            .await?;

    Ok(Json(UsageResponse {
        plan_id: plan.id,
        usage,
        calendar_syncs,
        limits: PlanLimits {
            max_events: plan.max_events,
            max_ai_requests: plan.max_ai_requests,
            max_calendar_syncs: plan.max_calendar_syncs,
        },
    }))
}
