use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::ERR_END_BEFORE_START;
use crate::error::{AppError, Result};

/// Where an event row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Local,
    Google,
    Outlook,
    Ai,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Local => "local",
            EventSource::Google => "google",
            EventSource::Outlook => "outlook",
            EventSource::Ai => "ai",
        }
    }
}

/// Calendar event owned by one user
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub all_day: bool,
    pub color: Option<String>,
    pub source: String,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attendee {
    pub id: Uuid,
    pub event_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub status: String,
}

/// Attendee as supplied by a client or a calendar provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttendee {
    pub email: String,
    pub name: Option<String>,
    pub status: Option<String>,
}

impl Event {
    /// An event must end strictly after it starts
    pub fn validate_time_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        if end <= start {
            return Err(AppError::InvalidInput(ERR_END_BEFORE_START.to_string()));
        }
        Ok(())
    }

    pub fn validate_title(title: &str) -> Result<()> {
        if title.trim().is_empty() {
            return Err(AppError::InvalidInput("title is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_validate_time_range() {
        let start = Utc::now();

        assert!(Event::validate_time_range(start, start + Duration::minutes(30)).is_ok());
        assert!(matches!(
            Event::validate_time_range(start, start),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            Event::validate_time_range(start, start - Duration::seconds(1)),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_validate_title() {
        assert!(Event::validate_title("Standup").is_ok());
        assert!(Event::validate_title("   ").is_err());
    }

    #[test]
    fn test_source_names() {
        assert_eq!(EventSource::Google.as_str(), "google");
        assert_eq!(EventSource::Outlook.as_str(), "outlook");
        assert_eq!(EventSource::Ai.as_str(), "ai");
    }
}
