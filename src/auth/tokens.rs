use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgExecutor, PgPool};
use uuid::Uuid;

use crate::constants::{EMAIL_VERIFICATION_TTL_SECS, PASSWORD_RESET_TTL_SECS};
use crate::error::{AppError, Result};
use crate::security::random_token;

/// Single-use tokens mailed to users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    EmailVerification,
    PasswordReset,
}

impl TokenKind {
    fn table(&self) -> &'static str {
        match self {
            TokenKind::EmailVerification => "email_verification_tokens",
            TokenKind::PasswordReset => "password_reset_tokens",
        }
    }

    fn ttl(&self) -> Duration {
        match self {
            TokenKind::EmailVerification => Duration::seconds(EMAIL_VERIFICATION_TTL_SECS),
            TokenKind::PasswordReset => Duration::seconds(PASSWORD_RESET_TTL_SECS),
        }
    }
}

/// Create a fresh token for a user, replacing any earlier one of the same kind
pub async fn issue(conn: &mut PgConnection, kind: TokenKind, user_id: Uuid) -> Result<String> {
    let token = random_token();
    let expires_at = Utc::now() + kind.ttl();

    sqlx::query(&format!("DELETE FROM {} WHERE user_id = $1", kind.table()))
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(&format!(
        "INSERT INTO {} (token, user_id, expires_at) VALUES ($1, $2, $3)",
        kind.table()
    ))
    .bind(&token)
    .bind(user_id)
    .bind(expires_at)
    .execute(&mut *conn)
    .await?;

    Ok(token)
}

/// Delete a token and return its owner
///
/// Unknown, already used and expired tokens all yield `InvalidToken`; an
/// expired token is deleted as a side effect.
pub async fn consume<'e>(
    executor: impl PgExecutor<'e>,
    kind: TokenKind,
    token: &str,
) -> Result<Uuid> {
    let row: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(&format!(
        "DELETE FROM {} WHERE token = $1 RETURNING user_id, expires_at",
        kind.table()
    ))
    .bind(token)
    .fetch_optional(executor)
    .await?;

    match row {
        Some((user_id, expires_at)) if expires_at > Utc::now() => Ok(user_id),
        Some(_) => {
            tracing::info!("Rejected expired {:?} token", kind);
            Err(AppError::InvalidToken)
        }
        None => Err(AppError::InvalidToken),
    }
}

/// Remove expired tokens of both kinds, returning how many were deleted
pub async fn purge_expired(pool: &PgPool) -> Result<u64> {
    let mut deleted = 0;
    for kind in [TokenKind::EmailVerification, TokenKind::PasswordReset] {
        deleted += sqlx::query(&format!(
            "DELETE FROM {} WHERE expires_at <= NOW()",
            kind.table()
        ))
        .execute(pool)
        .await?
        .rows_affected();
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ttls() {
        assert_eq!(TokenKind::EmailVerification.ttl(), Duration::hours(24));
        assert_eq!(TokenKind::PasswordReset.ttl(), Duration::hours(1));
        assert_ne!(
            TokenKind::EmailVerification.table(),
            TokenKind::PasswordReset.table()
        );
    }
}
