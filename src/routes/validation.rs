use std::str::FromStr;

use crate::constants::MIN_PASSWORD_LENGTH;
use crate::error::{AppError, Result};
use crate::models::User;

/// Normalize and check an email supplied at sign-up
pub fn validate_signup_email(email: &str) -> Result<String> {
    let email = User::normalize_email(email);
    if !User::validate_email(&email) {
        tracing::warn!("Rejected malformed email at sign-up");
        return Err(AppError::InvalidInput("A valid email is required".to_string()));
    }
    Ok(email)
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AppError::InvalidInput(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

/// Parse a provider path segment; unknown names are reported as 404
pub fn parse_provider<P: FromStr>(raw: &str) -> Result<P> {
    raw.parse().map_err(|_| {
        tracing::debug!("Unknown provider in path: {}", raw);
        AppError::NotFound("Provider")
    })
}

/// Trim an optional text field, treating blank as absent
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Require that a value is one of the allowed options
pub fn one_of(field: &str, value: &str, allowed: &[&str]) -> Result<()> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "{} must be one of: {}",
            field,
            allowed.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncProvider;

    #[test]
    fn test_validate_signup_email() {
        assert_eq!(
            validate_signup_email(" Ada@Example.com ").unwrap(),
            "ada@example.com"
        );
        assert!(validate_signup_email("nope").is_err());
    }

    #[test]
    fn test_validate_password() {
        assert!(validate_password("12345678").is_ok());
        assert!(validate_password("short").is_err());
    }

    #[test]
    fn test_parse_provider() {
        let provider: SyncProvider = parse_provider("google").unwrap();
        assert_eq!(provider, SyncProvider::Google);
        assert!(matches!(
            parse_provider::<SyncProvider>("myspace"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_non_blank_and_one_of() {
        assert_eq!(non_blank(Some("  x ".into())), Some("x".into()));
        assert_eq!(non_blank(Some("   ".into())), None);
        assert_eq!(non_blank(None), None);

        assert!(one_of("priority", "high", &["low", "high"]).is_ok());
        assert!(one_of("priority", "urgent", &["low", "high"]).is_err());
    }
}
