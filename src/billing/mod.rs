//! Plans, subscriptions and metering.

pub mod stripe;
pub mod usage;
pub mod webhook;

use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::constants::FREE_PLAN_ID;
use crate::error::Result;
use crate::models::Plan;

/// Plan whose limits currently apply to a user
///
/// The subscribed plan while the subscription is `trial`, `active` or
/// `past_due`; the free plan otherwise.
pub async fn effective_plan<'e>(executor: impl PgExecutor<'e>, user_id: Uuid) -> Result<Plan> {
    let plan = sqlx::query_as::<_, Plan>(
        r#"
        SELECT p.* FROM subscription_plans p
        WHERE p.id = COALESCE(
            (SELECT s.plan_id FROM user_subscriptions s
             WHERE s.user_id = $1 AND s.status IN ('trial', 'active', 'past_due')),
            $2
        )
        "#,
    )
    .bind(user_id)
    .bind(FREE_PLAN_ID)
    .fetch_one(executor)
    .await?;

    Ok(plan)
}

/// Move every trial whose end date has passed to `expired`
///
/// Rows in any other status are never touched, even with a past
/// `trial_end_date`.
pub async fn expire_trials(pool: &PgPool) -> Result<u64> {
    let expired = sqlx::query(
        r#"
        UPDATE user_subscriptions
        SET status = 'expired', updated_at = NOW()
        WHERE status = 'trial' AND trial_end_date <= NOW()
        "#,
    )
    .execute(pool)
    .await?
    .rows_affected();

    if expired > 0 {
        tracing::info!("Expired {} trial subscriptions", expired);
    }

    Ok(expired)
}
