use axum::{
    extract::{Path, Query, State},
    response::Redirect,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::MessageResponse;
use super::validation::parse_provider;
use crate::auth::oauth;
use crate::auth::AuthUser;
use crate::billing::effective_plan;
use crate::error::{AppError, Result};
use crate::models::{CalendarSync, SyncProvider};
use crate::security::{issue_state_token, verify_state_token};
use crate::sync::{self, SyncEngine, SyncReport};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/:provider/auth-url", get(auth_url))
        .route("/:provider/callback", get(callback))
        .route("/:provider/now", post(sync_now))
        .route("/:provider", put(update_connection).delete(disconnect))
}

#[derive(Debug, Serialize)]
pub struct AuthUrlResponse {
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConnectionRequest {
    pub sync_enabled: bool,
}

fn connect_purpose(provider: SyncProvider) -> String {
    format!("sync:{}", provider)
}

fn redirect_uri(state: &AppState, provider: SyncProvider) -> String {
    format!(
        "{}/api/sync/{}/callback",
        state.config.public_api_url, provider
    )
}

/// Consent URL for connecting a calendar
///
/// Refused with 403 when the plan's calendar connection allowance is used
/// up (reconnecting an already connected provider is always allowed).
pub async fn auth_url(
    State(state): State<AppState>,
    user: AuthUser,
    Path(provider): Path<String>,
) -> Result<Json<AuthUrlResponse>> {
    let provider: SyncProvider = parse_provider(&provider)?;
    let identity_provider = sync::oauth_provider(provider);
    let credentials = identity_provider
        .credentials(&state.config)
        .ok_or(AppError::NotConfigured("Calendar provider"))?;

    let plan = effective_plan(&state.pool, user.id).await?;
    if let Some(limit) = plan.max_calendar_syncs {
        let others: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM calendar_syncs WHERE user_id = $1 AND provider <> $2",
        )
        .bind(user.id)
        .bind(provider.as_str())
        .fetch_one(&state.pool)
        .await?;

        if others >= limit as i64 {
            return Err(AppError::Forbidden(format!(
                "Your plan allows {} connected calendar(s)",
                limit
            )));
        }
    }

    let oauth_state = issue_state_token(
        &connect_purpose(provider),
        &user.id.to_string(),
        &state.config.jwt_secret,
    )?;

    let url = oauth::authorization_url(
        &identity_provider.authorize_url(&state.config.microsoft_tenant),
        &credentials.client_id,
        &redirect_uri(&state, provider),
        sync::connect_scopes(provider),
        &oauth_state,
        sync::connect_params(provider),
    )?;

    Ok(Json(AuthUrlResponse { url }))
}

/// Provider redirect after consent
///
/// Reached by the browser without a session token; the signed `state`
/// names the user. Always ends in a redirect to the frontend settings page.
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<ConnectCallback>,
) -> Result<Redirect> {
    let provider: SyncProvider = parse_provider(&provider)?;
    let settings_url = format!("{}/settings/calendars", state.config.frontend_url);

    match connect(&state, provider, params).await {
        Ok(account) => {
            let engine = SyncEngine::from_state(&state);
            tokio::spawn(async move {
                if let Err(e) = engine.sync_account(account).await {
                    tracing::warn!("Initial {} sync failed: {}", provider, e);
                }
            });
            Ok(Redirect::to(&format!("{}?connected={}", settings_url, provider)))
        }
        Err(e) => {
            tracing::error!("Connecting {} calendar failed: {}", provider, e);
            Ok(Redirect::to(&format!("{}?error=sync_failed", settings_url)))
        }
    }
}

async fn connect(state: &AppState, provider: SyncProvider, params: ConnectCallback) -> Result<CalendarSync> {
    if let Some(error) = params.error {
        return Err(AppError::Upstream(format!("provider returned error: {}", error)));
    }

    let oauth_state = params.state.ok_or(AppError::InvalidToken)?;
    let subject = verify_state_token(&oauth_state, &connect_purpose(provider), &state.config.jwt_secret)?;
    let user_id = Uuid::parse_str(&subject).map_err(|_| AppError::InvalidToken)?;
    let code = params
        .code
        .ok_or_else(|| AppError::InvalidInput("Missing authorization code".to_string()))?;

    let identity_provider = sync::oauth_provider(provider);
    let credentials = identity_provider
        .credentials(&state.config)
        .ok_or(AppError::NotConfigured("Calendar provider"))?;

    let tokens = oauth::exchange_code(
        &state.http,
        &identity_provider.token_url(&state.config.microsoft_tenant),
        credentials,
        &code,
        &redirect_uri(state, provider),
    )
    .await?;

    let account = sqlx::query_as::<_, CalendarSync>(
        r#"
        INSERT INTO calendar_syncs
            (id, user_id, provider, access_token, refresh_token, token_expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (user_id, provider) DO UPDATE
        SET access_token = EXCLUDED.access_token,
            refresh_token = COALESCE(EXCLUDED.refresh_token, calendar_syncs.refresh_token),
            token_expires_at = EXCLUDED.token_expires_at,
            sync_enabled = TRUE,
            last_error = NULL,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(provider.as_str())
    .bind(&tokens.access_token)
    .bind(&tokens.refresh_token)
    .bind(tokens.expires_at(Utc::now()))
    .fetch_one(&state.pool)
    .await?;

    tracing::info!("User {} connected {} calendar", user_id, provider);
    Ok(account)
}

pub async fn status(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<CalendarSync>>> {
    let accounts = sqlx::query_as::<_, CalendarSync>(
        "SELECT * FROM calendar_syncs WHERE user_id = $1 ORDER BY provider",
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(accounts))
}

async fn find_connection(state: &AppState, user_id: Uuid, provider: SyncProvider) -> Result<CalendarSync> {
    sqlx::query_as::<_, CalendarSync>(
        "SELECT * FROM calendar_syncs WHERE user_id = $1 AND provider = $2",
    )
    .bind(user_id)
    .bind(provider.as_str())
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::NotFound("Calendar connection"))
}

/// Run a sync for one connection right away
pub async fn sync_now(
    State(state): State<AppState>,
    user: AuthUser,
    Path(provider): Path<String>,
) -> Result<Json<SyncReport>> {
    let provider: SyncProvider = parse_provider(&provider)?;
    let account = find_connection(&state, user.id, provider).await?;

    let report = SyncEngine::from_state(&state).sync_account(account).await?;
    Ok(Json(report))
}

pub async fn update_connection(
    State(state): State<AppState>,
    user: AuthUser,
    Path(provider): Path<String>,
    Json(payload): Json<UpdateConnectionRequest>,
) -> Result<Json<CalendarSync>> {
    let provider: SyncProvider = parse_provider(&provider)?;

    let account = sqlx::query_as::<_, CalendarSync>(
        r#"
        UPDATE calendar_syncs
        SET sync_enabled = $1, updated_at = NOW()
        WHERE user_id = $2 AND provider = $3
        RETURNING *
        "#,
    )
    .bind(payload.sync_enabled)
    .bind(user.id)
    .bind(provider.as_str())
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::NotFound("Calendar connection"))?;

    Ok(Json(account))
}

/// Forget the connection and its tokens; already synced events stay
pub async fn disconnect(
    State(state): State<AppState>,
    user: AuthUser,
    Path(provider): Path<String>,
) -> Result<Json<MessageResponse>> {
    let provider: SyncProvider = parse_provider(&provider)?;

    let removed = sqlx::query("DELETE FROM calendar_syncs WHERE user_id = $1 AND provider = $2")
        .bind(user.id)
        .bind(provider.as_str())
        .execute(&state.pool)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(AppError::NotFound("Calendar connection"));
    }

    tracing::info!("User {} disconnected {} calendar", user.id, provider);
    Ok(MessageResponse::ok("Calendar disconnected"))
}
