use chrono::{Datelike, NaiveDate, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::effective_plan;
use crate::error::{AppError, Result};
use crate::models::{Plan, UsageRecord};

/// Metered actions, counted per calendar month
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageMetric {
    EventsCreated,
    AiRequests,
}

impl UsageMetric {
    fn column(&self) -> &'static str {
        match self {
            UsageMetric::EventsCreated => "events_created",
            UsageMetric::AiRequests => "ai_requests",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UsageMetric::EventsCreated => "events",
            UsageMetric::AiRequests => "AI requests",
        }
    }

    /// Monthly allowance on a plan; `None` is unlimited
    pub fn limit(&self, plan: &Plan) -> Option<i32> {
        match self {
            UsageMetric::EventsCreated => plan.max_events,
            UsageMetric::AiRequests => plan.max_ai_requests,
        }
    }
}

/// First day of the month containing `date`
pub fn period_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Count one use of `metric`, refusing once the plan's allowance is spent
///
/// Run it inside the transaction of the metered write so a failed write
/// does not consume allowance.
pub async fn record_usage(conn: &mut PgConnection, user_id: Uuid, metric: UsageMetric) -> Result<()> {
    let plan = effective_plan(&mut *conn, user_id).await?;
    let limit = metric.limit(&plan);
    let period = period_start(Utc::now().date_naive());

    sqlx::query(
        r#"
        INSERT INTO user_usage (id, user_id, period_start)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id, period_start) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(period)
    .execute(&mut *conn)
    .await?;

    let column = metric.column();
    let counted: Option<i32> = sqlx::query_scalar(&format!(
        r#"
        UPDATE user_usage
        SET {column} = {column} + 1, updated_at = NOW()
        WHERE user_id = $1 AND period_start = $2
          AND ($3::INT4 IS NULL OR {column} < $3)
        RETURNING {column}
        "#
    ))
    .bind(user_id)
    .bind(period)
    .bind(limit)
    .fetch_optional(&mut *conn)
    .await?;

    match counted {
        Some(count) => {
            tracing::debug!("User {} {} this month: {}", user_id, metric.label(), count);
            Ok(())
        }
        None => {
            tracing::warn!(
                "User {} reached the {} limit of plan {}",
                user_id,
                metric.label(),
                plan.id
            );
            Err(AppError::UsageLimitExceeded(metric.label()))
        }
    }
}

/// Counters for the current month (zeros when nothing was recorded yet)
pub async fn current_usage(conn: &mut PgConnection, user_id: Uuid) -> Result<UsageRecord> {
    let period = period_start(Utc::now().date_naive());

    let record = sqlx::query_as::<_, UsageRecord>(
        r#"
        SELECT period_start, events_created, ai_requests
        FROM user_usage
        WHERE user_id = $1 AND period_start = $2
        "#,
    )
    .bind(user_id)
    .bind(period)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(record.unwrap_or(UsageRecord {
        period_start: period,
        events_created: 0,
        ai_requests: 0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(max_events: Option<i32>, max_ai_requests: Option<i32>) -> Plan {
        Plan {
            id: "test".into(),
            name: "Test".into(),
            price_cents: 0,
            currency: "usd".into(),
            billing_interval: "month".into(),
            stripe_price_id: None,
            max_events,
            max_ai_requests,
            max_calendar_syncs: None,
            trial_days: 0,
            features: json!([]),
        }
    }

    #[test]
    fn test_period_start() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(period_start(date), NaiveDate::from_ymd_opt(2026, 10, 1).unwrap());

        let first = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        assert_eq!(period_start(first), first);
    }

    #[test]
    fn test_metric_limits() {
        let p = plan(Some(100), None);
        assert_eq!(UsageMetric::EventsCreated.limit(&p), Some(100));
        assert_eq!(UsageMetric::AiRequests.limit(&p), None);
    }
}
