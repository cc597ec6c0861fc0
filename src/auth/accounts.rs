use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use super::oauth::{OAuthIdentity, OAuthTokens};
use crate::error::{AppError, Result};
use crate::models::User;

/// Find or create the user behind an OAuth sign-in
///
/// 1. An existing `(provider, provider_user_id)` link wins; its tokens are
///    refreshed.
/// 2. Otherwise a user with the same email gets the provider linked.
/// 3. Otherwise a new, already verified, user is created.
pub async fn resolve_oauth_user(
    pool: &PgPool,
    provider: &str,
    identity: &OAuthIdentity,
    tokens: &OAuthTokens,
) -> Result<User> {
    let now = Utc::now();
    let expires_at = tokens.expires_at(now);
    let mut tx = pool.begin().await?;

    let linked: Option<Uuid> = sqlx::query_scalar(
        "SELECT user_id FROM user_auth_providers WHERE provider = $1 AND provider_user_id = $2",
    )
    .bind(provider)
    .bind(&identity.provider_user_id)
    .fetch_optional(&mut *tx)
    .await?;

    let user_id = match linked {
        Some(user_id) => {
            sqlx::query(
                r#"
                UPDATE user_auth_providers
                SET access_token = $1,
                    refresh_token = COALESCE($2, refresh_token),
                    token_expires_at = $3,
                    updated_at = NOW()
                WHERE provider = $4 AND provider_user_id = $5
                "#,
            )
            .bind(&tokens.access_token)
            .bind(&tokens.refresh_token)
            .bind(expires_at)
            .bind(provider)
            .bind(&identity.provider_user_id)
            .execute(&mut *tx)
            .await?;

            tracing::info!("OAuth sign-in via existing {} link for {}", provider, user_id);
            user_id
        }
        None => {
            let email = identity
                .email
                .as_deref()
                .map(User::normalize_email)
                .filter(|email| User::validate_email(email))
                .ok_or_else(|| {
                    AppError::InvalidInput(format!("{} did not share an email address", provider))
                })?;

            let existing: Option<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
                .bind(&email)
                .fetch_optional(&mut *tx)
                .await?;

            let user_id = match existing {
                Some(user_id) => {
                    tracing::info!("Linking {} identity to existing user {}", provider, user_id);
                    user_id
                }
                None => {
                    let user_id = Uuid::new_v4();
                    sqlx::query(
                        r#"
                        INSERT INTO users (id, email, name, avatar_url, email_verified)
                        VALUES ($1, $2, $3, $4, TRUE)
                        "#,
                    )
                    .bind(user_id)
                    .bind(&email)
                    .bind(identity.name.clone().unwrap_or_default())
                    .bind(&identity.avatar_url)
                    .execute(&mut *tx)
                    .await?;

                    tracing::info!("Created user {} from {} sign-in", user_id, provider);
                    user_id
                }
            };

            // A user relinking the same provider with a different account
            // replaces the old link.
            sqlx::query(
                r#"
                INSERT INTO user_auth_providers
                    (id, user_id, provider, provider_user_id, access_token, refresh_token, token_expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (user_id, provider) DO UPDATE
                SET provider_user_id = EXCLUDED.provider_user_id,
                    access_token = EXCLUDED.access_token,
                    refresh_token = EXCLUDED.refresh_token,
                    token_expires_at = EXCLUDED.token_expires_at,
                    updated_at = NOW()
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(provider)
            .bind(&identity.provider_user_id)
            .bind(&tokens.access_token)
            .bind(&tokens.refresh_token)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

            user_id
        }
    };

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(user)
}

/// Load a user by id
pub async fn find_user(pool: &PgPool, user_id: Uuid) -> Result<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("User"))
}
