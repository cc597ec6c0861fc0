use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::EventSource;

/// Third-party calendar the sync engine can pull from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncProvider {
    Google,
    Outlook,
}

impl SyncProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncProvider::Google => "google",
            SyncProvider::Outlook => "outlook",
        }
    }

    pub fn event_source(&self) -> EventSource {
        match self {
            SyncProvider::Google => EventSource::Google,
            SyncProvider::Outlook => EventSource::Outlook,
        }
    }
}

impl fmt::Display for SyncProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(SyncProvider::Google),
            "outlook" | "microsoft" => Ok(SyncProvider::Outlook),
            other => Err(format!("unknown calendar provider: {}", other)),
        }
    }
}

/// Per-user, per-provider sync configuration
///
/// Tokens never leave the server.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CalendarSync {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub calendar_id: String,
    pub sync_enabled: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalendarSync {
    /// True when the access token is expired or will be within `margin_secs`
    ///
    /// Rows without a recorded expiry are assumed valid.
    pub fn token_needs_refresh(&self, now: DateTime<Utc>, margin_secs: i64) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at <= now + chrono::Duration::seconds(margin_secs),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(expires_at: Option<DateTime<Utc>>) -> CalendarSync {
        let now = Utc::now();
        CalendarSync {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: "google".into(),
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            token_expires_at: expires_at,
            calendar_id: "primary".into(),
            sync_enabled: true,
            last_sync: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("google".parse::<SyncProvider>(), Ok(SyncProvider::Google));
        assert_eq!("Outlook".parse::<SyncProvider>(), Ok(SyncProvider::Outlook));
        assert_eq!("microsoft".parse::<SyncProvider>(), Ok(SyncProvider::Outlook));
        assert!("yahoo".parse::<SyncProvider>().is_err());
        assert_eq!(SyncProvider::Outlook.to_string(), "outlook");
    }

    #[test]
    fn test_token_needs_refresh() {
        let now = Utc::now();
        assert!(row(Some(now - Duration::minutes(5))).token_needs_refresh(now, 60));
        assert!(row(Some(now + Duration::seconds(30))).token_needs_refresh(now, 60));
        assert!(!row(Some(now + Duration::minutes(30))).token_needs_refresh(now, 60));
        assert!(!row(None).token_needs_refresh(now, 60));
    }

    #[test]
    fn test_tokens_are_not_serialized() {
        let json = serde_json::to_value(row(None)).unwrap();
        assert!(json.get("access_token").is_none());
        assert!(json.get("refresh_token").is_none());
        assert_eq!(json["provider"], "google");
    }
}
