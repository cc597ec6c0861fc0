use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::validation::{validate_password, validate_signup_email};
use crate::auth::accounts::find_user;
use crate::auth::tokens::{self, TokenKind};
use crate::auth::AuthUser;
use crate::error::{conflict_on_unique, AppError, Result};
use crate::models::user::LOCAL_PROVIDER;
use crate::models::User;
use crate::security::{hash_password, issue_jwt, verify_password};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/verify-email", post(verify_email))
        .route("/resend-verification", post(resend_verification))
        .route("/forgot-password", post(forgot_password))
        .route("/reset-password", post(reset_password))
        .route("/me", get(me))
        .merge(super::oauth::routes())
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

const ERR_USER_EXISTS: &str = "User already exists";

/// Token plus the user it was issued for
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

/// Argon2 is deliberately slow; keep it off the async workers
async fn hash_blocking(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| AppError::PasswordHash(e.to_string()))?
}

/// Register a local email/password account
///
/// Returns 409 Conflict if the email already belongs to a user, including
/// when a concurrent registration wins the insert. The verification link is
/// only logged; delivering mail is not this service's job.
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<SessionResponse>)> {
    let email = validate_signup_email(&payload.email)?;
    validate_password(&payload.password)?;

    let password_hash = hash_blocking(payload.password).await?;

    let mut tx = state.pool.begin().await?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
        .bind(&email)
        .fetch_one(&mut *tx)
        .await?;
    if exists {
        tracing::info!("Registration attempt for existing email");
        return Err(AppError::Conflict(ERR_USER_EXISTS.to_string()));
    }

    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (id, email, name) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&email)
    .bind(payload.name.trim())
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| conflict_on_unique(e, ERR_USER_EXISTS))?;

    sqlx::query(
        r#"
        INSERT INTO user_auth_providers (id, user_id, provider, provider_user_id, password_hash)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.id)
    .bind(LOCAL_PROVIDER)
    .bind(&email)
    .bind(&password_hash)
    .execute(&mut *tx)
    .await
    .map_err(|e| conflict_on_unique(e, ERR_USER_EXISTS))?;

    let verification = tokens::issue(&mut tx, TokenKind::EmailVerification, user.id).await?;

    tx.commit().await?;

    tracing::info!("New user registered: {}", user.id);
    tracing::debug!(
        "Verification link: {}/verify-email?token={}",
        state.config.frontend_url,
        verification
    );

    let token = issue_jwt(user.id, &user.email, &state.config.jwt_secret)?;
    Ok((StatusCode::CREATED, Json(SessionResponse { token, user })))
}

/// Sign in with email and password
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionResponse>> {
    let email = User::normalize_email(&payload.email);

    let record: Option<(Uuid, Option<String>)> = sqlx::query_as(
        r#"
        SELECT user_id, password_hash FROM user_auth_providers
        WHERE provider = $1 AND provider_user_id = $2
        "#,
    )
    .bind(LOCAL_PROVIDER)
    .bind(&email)
    .fetch_optional(&state.pool)
    .await?;

    let Some((user_id, Some(stored_hash))) = record else {
        tracing::info!("Login attempt for unknown local account");
        return Err(AppError::InvalidCredentials);
    };

    let password = payload.password;
    let matches = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
        .await
        .map_err(|e| AppError::PasswordHash(e.to_string()))?;
    if !matches {
        tracing::info!("Wrong password for user {}", user_id);
        return Err(AppError::InvalidCredentials);
    }

    let user = find_user(&state.pool, user_id).await?;
    let token = issue_jwt(user.id, &user.email, &state.config.jwt_secret)?;

    Ok(Json(SessionResponse { token, user }))
}

/// Confirm an email address with the token from the verification link
pub async fn verify_email(
    State(state): State<AppState>,
    Json(payload): Json<TokenRequest>,
) -> Result<Json<MessageResponse>> {
    let mut tx = state.pool.begin().await?;

    let user_id = tokens::consume(&mut *tx, TokenKind::EmailVerification, &payload.token).await?;
    sqlx::query("UPDATE users SET email_verified = TRUE, updated_at = NOW() WHERE id = $1")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!("Email verified for user {}", user_id);
    Ok(MessageResponse::ok("Email verified"))
}

pub async fn resend_verification(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<MessageResponse>> {
    let current = find_user(&state.pool, user.id).await?;
    if current.email_verified {
        return Err(AppError::InvalidInput("Email is already verified".to_string()));
    }

    let mut conn = state.pool.acquire().await?;
    let token = tokens::issue(&mut conn, TokenKind::EmailVerification, user.id).await?;

    tracing::debug!(
        "Verification link: {}/verify-email?token={}",
        state.config.frontend_url,
        token
    );
    Ok(MessageResponse::ok("Verification email sent"))
}

/// Start a password reset
///
/// Always answers 200 so the endpoint cannot be used to discover accounts.
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>> {
    let email = User::normalize_email(&payload.email);

    let user_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT user_id FROM user_auth_providers WHERE provider = $1 AND provider_user_id = $2",
    )
    .bind(LOCAL_PROVIDER)
    .bind(&email)
    .fetch_optional(&state.pool)
    .await?;

    if let Some(user_id) = user_id {
        let mut conn = state.pool.acquire().await?;
        let token = tokens::issue(&mut conn, TokenKind::PasswordReset, user_id).await?;
        tracing::info!("Password reset requested for user {}", user_id);
        tracing::debug!(
            "Reset link: {}/reset-password?token={}",
            state.config.frontend_url,
            token
        );
    }

    Ok(MessageResponse::ok(
        "If an account exists for that email, a reset link has been sent",
    ))
}

/// Set a new password with a single-use reset token
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>> {
    validate_password(&payload.password)?;
    let password_hash = hash_blocking(payload.password).await?;

    let mut tx = state.pool.begin().await?;

    let user_id = tokens::consume(&mut *tx, TokenKind::PasswordReset, &payload.token).await?;
    sqlx::query(
        r#"
        UPDATE user_auth_providers
        SET password_hash = $1, updated_at = NOW()
        WHERE user_id = $2 AND provider = $3
        "#,
    )
    .bind(&password_hash)
    .bind(user_id)
    .bind(LOCAL_PROVIDER)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!("Password reset completed for user {}", user_id);
    Ok(MessageResponse::ok("Password has been reset"))
}

pub async fn me(State(state): State<AppState>, user: AuthUser) -> Result<Json<User>> {
    Ok(Json(find_user(&state.pool, user.id).await?))
}
