use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription plan offered to users
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub price_cents: i32,
    pub currency: String,
    pub billing_interval: String,
    #[serde(skip_serializing)]
    pub stripe_price_id: Option<String>,
    /// `None` means unlimited
    pub max_events: Option<i32>,
    pub max_ai_requests: Option<i32>,
    pub max_calendar_syncs: Option<i32>,
    pub trial_days: i32,
    pub features: serde_json::Value,
}

/// Local lifecycle state of a user's subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Map a Stripe subscription status onto the local states
    ///
    /// Returns `None` for states with no local counterpart (`incomplete`,
    /// `paused`), which leave the row untouched.
    pub fn from_stripe(status: &str) -> Option<Self> {
        match status {
            "trialing" => Some(SubscriptionStatus::Trial),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "incomplete_expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }

    /// Whether the subscribed plan's limits apply
    pub fn grants_plan(status: &str) -> bool {
        matches!(status, "trial" | "active" | "past_due")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub status: String,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_subscription_id: Option<String>,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One invoice outcome mirrored from Stripe
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_invoice_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub description: Option<String>,
    pub invoice_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Monthly usage counters
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageRecord {
    pub period_start: NaiveDate,
    pub events_created: i32,
    pub ai_requests: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_stripe() {
        assert_eq!(
            SubscriptionStatus::from_stripe("trialing"),
            Some(SubscriptionStatus::Trial)
        );
        assert_eq!(
            SubscriptionStatus::from_stripe("unpaid"),
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(
            SubscriptionStatus::from_stripe("incomplete_expired"),
            Some(SubscriptionStatus::Expired)
        );
        assert_eq!(SubscriptionStatus::from_stripe("incomplete"), None);
    }

    #[test]
    fn test_grants_plan() {
        assert!(SubscriptionStatus::grants_plan("trial"));
        assert!(SubscriptionStatus::grants_plan("past_due"));
        assert!(!SubscriptionStatus::grants_plan("expired"));
        assert!(!SubscriptionStatus::grants_plan("canceled"));
    }
}
