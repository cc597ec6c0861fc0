use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;

use super::auth::MessageResponse;
use super::validation::non_blank;
use crate::auth::accounts::find_user;
use crate::auth::AuthUser;
use crate::billing::stripe::StripeClient;
use crate::error::{AppError, Result};
use crate::models::{AuthProviderLink, User};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/profile", get(get_profile).put(update_profile))
        .route("/providers", get(list_providers))
        .route("/providers/:provider", delete(unlink_provider))
        .route("/account", delete(delete_account))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub timezone: Option<String>,
    pub avatar_url: Option<String>,
}

pub async fn get_profile(State(state): State<AppState>, user: AuthUser) -> Result<Json<User>> {
    Ok(Json(find_user(&state.pool, user.id).await?))
}

pub async fn update_profile(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<User>> {
    let timezone = non_blank(payload.timezone);
    if let Some(tz) = &timezone {
        if tz.len() > 64 || tz.contains(char::is_whitespace) {
            return Err(AppError::InvalidInput("Invalid timezone".to_string()));
        }
    }

    let updated = sqlx::query_as::<_, User>(
        r#"
        UPDATE users
        SET name = COALESCE($1, name),
            timezone = COALESCE($2, timezone),
            avatar_url = COALESCE($3, avatar_url),
            updated_at = NOW()
        WHERE id = $4
        RETURNING *
        "#,
    )
    .bind(non_blank(payload.name))
    .bind(timezone)
    .bind(non_blank(payload.avatar_url))
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::NotFound("User"))?;

    Ok(Json(updated))
}

pub async fn list_providers(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<AuthProviderLink>>> {
    let links = sqlx::query_as::<_, AuthProviderLink>(
        r#"
        SELECT provider, provider_user_id, created_at
        FROM user_auth_providers
        WHERE user_id = $1
        ORDER BY created_at
        "#,
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(links))
}

/// Remove a sign-in method; the last one cannot be removed
pub async fn unlink_provider(
    State(state): State<AppState>,
    user: AuthUser,
    Path(provider): Path<String>,
) -> Result<Json<MessageResponse>> {
    let mut tx = state.pool.begin().await?;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_auth_providers WHERE user_id = $1")
        .bind(user.id)
        .fetch_one(&mut *tx)
        .await?;

    if count <= 1 {
        return Err(AppError::InvalidInput(
            "Cannot remove the only sign-in method".to_string(),
        ));
    }

    let removed = sqlx::query("DELETE FROM user_auth_providers WHERE user_id = $1 AND provider = $2")
        .bind(user.id)
        .bind(provider.to_ascii_lowercase())
        .execute(&mut *tx)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(AppError::NotFound("Provider link"));
    }

    tx.commit().await?;

    tracing::info!("User {} unlinked {}", user.id, provider);
    Ok(MessageResponse::ok("Provider unlinked"))
}

/// Delete the account and, through foreign keys, everything it owns
///
/// A live Stripe subscription is ended first so the customer stops being
/// billed; a Stripe failure is logged and does not block the deletion.
pub async fn delete_account(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<MessageResponse>> {
    let live_subscription: Option<String> = sqlx::query_scalar(
        r#"
        SELECT stripe_subscription_id FROM user_subscriptions
        WHERE user_id = $1
          AND stripe_subscription_id IS NOT NULL
          AND status IN ('trial', 'active', 'past_due')
        "#,
    )
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?;

    if let Some(subscription_id) = live_subscription {
        match StripeClient::from_state(&state) {
            Ok(stripe) => {
                if let Err(e) = stripe.cancel_now(&subscription_id).await {
                    tracing::error!(
                        "Could not cancel Stripe subscription {} for deleted user {}: {}",
                        subscription_id,
                        user.id,
                        e
                    );
                }
            }
            Err(_) => tracing::warn!(
                "Stripe is not configured; subscription {} left untouched",
                subscription_id
            ),
        }
    }

    let removed = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(user.id)
        .execute(&state.pool)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(AppError::NotFound("User"));
    }

    tracing::info!("User {} and all associated data deleted", user.id);
    Ok(MessageResponse::ok(
        "User and all associated data permanently deleted",
    ))
}
