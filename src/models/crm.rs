use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Company {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub industry: Option<String>,
    pub website: Option<String>,
    pub size: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contact {
    pub id: Uuid,
    pub user_id: Uuid,
    pub company_id: Option<Uuid>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub job_title: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lead {
    pub id: Uuid,
    pub user_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub source: String,
    pub status: String,
    pub estimated_value_cents: Option<i64>,
    pub score: i32,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const LEAD_STATUSES: [&str; 5] = ["new", "contacted", "qualified", "unqualified", "converted"];

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Deal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub company_id: Option<Uuid>,
    pub title: String,
    pub value_cents: i64,
    pub stage: String,
    pub probability: i32,
    pub expected_close_date: Option<NaiveDate>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DealStageChange {
    pub id: Uuid,
    pub deal_id: Uuid,
    pub from_stage: Option<String>,
    pub to_stage: String,
    pub changed_at: DateTime<Utc>,
}

/// Sales pipeline stage of a deal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealStage {
    Prospecting,
    Qualification,
    Proposal,
    Negotiation,
    ClosedWon,
    ClosedLost,
}

impl DealStage {
    pub const ALL: [DealStage; 6] = [
        DealStage::Prospecting,
        DealStage::Qualification,
        DealStage::Proposal,
        DealStage::Negotiation,
        DealStage::ClosedWon,
        DealStage::ClosedLost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DealStage::Prospecting => "prospecting",
            DealStage::Qualification => "qualification",
            DealStage::Proposal => "proposal",
            DealStage::Negotiation => "negotiation",
            DealStage::ClosedWon => "closed_won",
            DealStage::ClosedLost => "closed_lost",
        }
    }

    /// Win probability (percent) assumed when a deal enters the stage
    pub fn default_probability(&self) -> i32 {
        match self {
            DealStage::Prospecting => 10,
            DealStage::Qualification => 25,
            DealStage::Proposal => 50,
            DealStage::Negotiation => 75,
            DealStage::ClosedWon => 100,
            DealStage::ClosedLost => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, DealStage::ClosedWon | DealStage::ClosedLost)
    }
}

impl FromStr for DealStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DealStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown deal stage: {}", s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrmTask {
    pub id: Uuid,
    pub user_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: String,
    pub status: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const TASK_PRIORITIES: [&str; 3] = ["low", "medium", "high"];

pub const TASK_STATUSES: [&str; 4] = ["pending", "in_progress", "completed", "canceled"];

pub const ACTIVITY_TYPES: [&str; 5] = ["call", "email", "meeting", "note", "task"];

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Activity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
    pub activity_type: String,
    pub subject: String,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deal_stage_parse() {
        for stage in DealStage::ALL {
            assert_eq!(stage.as_str().parse::<DealStage>(), Ok(stage));
        }
        assert!("won".parse::<DealStage>().is_err());
    }

    #[test]
    fn test_deal_stage_probabilities() {
        assert_eq!(DealStage::Prospecting.default_probability(), 10);
        assert_eq!(DealStage::ClosedWon.default_probability(), 100);
        assert_eq!(DealStage::ClosedLost.default_probability(), 0);
        assert!(DealStage::ClosedLost.is_closed());
        assert!(!DealStage::Negotiation.is_closed());
    }
}
