use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider name of email/password accounts in `user_auth_providers`
pub const LOCAL_PROVIDER: &str = "local";

/// User row as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub timezone: String,
    pub email_verified: bool,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One linked sign-in method, without its secrets
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuthProviderLink {
    pub provider: String,
    pub provider_user_id: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Minimal shape check: something before and after a single `@`,
    /// and a dot in the domain part
    pub fn validate_email(email: &str) -> bool {
        let email = email.trim();
        if email.len() > 254 || email.chars().any(char::is_whitespace) {
            return false;
        }
        match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
            }
            None => false,
        }
    }

    /// Emails are compared case-insensitively
    pub fn normalize_email(email: &str) -> String {
        email.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert!(User::validate_email("ada@example.com"));
        assert!(User::validate_email("  ada.lovelace+cal@mail.example.org "));

        assert!(!User::validate_email("ada"));
        assert!(!User::validate_email("@example.com"));
        assert!(!User::validate_email("ada@localhost"));
        assert!(!User::validate_email("ada@@example.com"));
        assert!(!User::validate_email("ada lovelace@example.com"));
        assert!(!User::validate_email("ada@example."));
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(User::normalize_email(" Ada@Example.COM "), "ada@example.com");
    }
}
