use axum::{
    extract::{Path, Query, State},
    http::header::SET_COOKIE,
    response::{IntoResponse, Redirect},
    routing::get,
    Form, Router,
};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use serde_json::Value;

use super::validation::parse_provider;
use crate::auth::accounts::resolve_oauth_user;
use crate::auth::oauth::{self, OAuthProvider};
use crate::constants::OAUTH_STATE_TTL_SECS;
use crate::error::{AppError, Result};
use crate::security::{issue_jwt, issue_state_token, random_token, verify_state_token};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/oauth/:provider", get(start_login))
        .route(
            "/oauth/:provider/callback",
            get(callback_query).post(callback_form),
        )
}

/// Parameters a provider sends back to the redirect URI
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    /// Apple only: JSON with the user's name, sent on first consent
    pub user: Option<String>,
}

/// Holds the nonce carried in the login `state`, so a callback only
/// completes in the browser that started the sign-in
const LOGIN_NONCE_COOKIE: &str = "neurocal_oauth_nonce";
const LOGIN_NONCE_PATH: &str = "/api/auth/oauth";

fn login_purpose(provider: OAuthProvider) -> String {
    format!("login:{}", provider)
}

fn redirect_uri(state: &AppState, provider: OAuthProvider) -> String {
    format!(
        "{}/api/auth/oauth/{}/callback",
        state.config.public_api_url, provider
    )
}

fn nonce_cookie(state: &AppState, provider: OAuthProvider, value: &str, max_age: i64) -> String {
    // Apple posts the callback cross-site, which Lax cookies do not survive
    let same_site = if provider == OAuthProvider::Apple {
        "None; Secure"
    } else if state.config.is_production() {
        "Lax; Secure"
    } else {
        "Lax"
    };
    format!(
        "{}={}; Path={}; HttpOnly; SameSite={}; Max-Age={}",
        LOGIN_NONCE_COOKIE, value, LOGIN_NONCE_PATH, same_site, max_age
    )
}

/// The nonce signed into `state` must match the one this browser holds
fn check_nonce(cookie: Option<&str>, signed: &str) -> Result<()> {
    match cookie {
        Some(value) if !value.is_empty() && value == signed => Ok(()),
        Some(_) => {
            tracing::warn!("OAuth sign-in nonce does not match the browser cookie");
            Err(AppError::InvalidToken)
        }
        None => {
            tracing::warn!("OAuth sign-in callback without a nonce cookie");
            Err(AppError::InvalidToken)
        }
    }
}

/// Redirect the browser to the provider's consent page
pub async fn start_login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse> {
    let provider: OAuthProvider = parse_provider(&provider)?;
    let credentials = provider
        .credentials(&state.config)
        .ok_or(AppError::NotConfigured("OAuth provider"))?;

    let nonce = random_token();
    let oauth_state = issue_state_token(&login_purpose(provider), &nonce, &state.config.jwt_secret)?;

    let url = oauth::authorization_url(
        &provider.authorize_url(&state.config.microsoft_tenant),
        &credentials.client_id,
        &redirect_uri(&state, provider),
        provider.login_scopes(),
        &oauth_state,
        provider.login_params(),
    )?;

    tracing::debug!("Starting {} sign-in", provider);
    let cookie = nonce_cookie(&state, provider, &nonce, OAUTH_STATE_TTL_SECS);
    Ok(([(SET_COOKIE, cookie)], Redirect::temporary(&url)))
}

pub async fn callback_query(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<impl IntoResponse> {
    finish_login(state, provider, jar, params).await
}

pub async fn callback_form(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
    Form(params): Form<CallbackParams>,
) -> Result<impl IntoResponse> {
    finish_login(state, provider, jar, params).await
}

/// Complete the sign-in and hand the session token to the frontend
///
/// Anything that goes wrong after the provider is known sends the browser
/// back to the frontend with `error=oauth_failed` instead of a JSON error.
/// The nonce cookie is cleared either way.
async fn finish_login(
    state: AppState,
    provider: String,
    jar: CookieJar,
    params: CallbackParams,
) -> Result<impl IntoResponse> {
    let provider: OAuthProvider = parse_provider(&provider)?;
    let frontend = state.config.frontend_url.clone();
    let nonce = jar.get(LOGIN_NONCE_COOKIE).map(|c| c.value().to_string());
    let clear = [(SET_COOKIE, nonce_cookie(&state, provider, "", 0))];

    match complete(&state, provider, nonce.as_deref(), params).await {
        Ok(token) => Ok((
            clear,
            Redirect::to(&format!("{}/auth/callback?token={}", frontend, token)),
        )),
        Err(e) => {
            tracing::error!("{} sign-in failed: {}", provider, e);
            Ok((
                clear,
                Redirect::to(&format!("{}/auth/callback?error=oauth_failed", frontend)),
            ))
        }
    }
}

async fn complete(
    state: &AppState,
    provider: OAuthProvider,
    nonce: Option<&str>,
    params: CallbackParams,
) -> Result<String> {
    if let Some(error) = params.error {
        return Err(AppError::Upstream(format!("provider returned error: {}", error)));
    }

    let credentials = provider
        .credentials(&state.config)
        .ok_or(AppError::NotConfigured("OAuth provider"))?;
    let code = params
        .code
        .ok_or_else(|| AppError::InvalidInput("Missing authorization code".to_string()))?;
    let oauth_state = params.state.ok_or(AppError::InvalidToken)?;
    let signed_nonce =
        verify_state_token(&oauth_state, &login_purpose(provider), &state.config.jwt_secret)?;
    check_nonce(nonce, &signed_nonce)?;

    let tokens = oauth::exchange_code(
        &state.http,
        &provider.token_url(&state.config.microsoft_tenant),
        credentials,
        &code,
        &redirect_uri(state, provider),
    )
    .await?;

    let mut identity = oauth::fetch_identity(&state.http, provider, &tokens).await?;
    if identity.name.is_none() {
        identity.name = params.user.as_deref().and_then(apple_user_name);
    }

    let user = resolve_oauth_user(&state.pool, provider.as_str(), &identity, &tokens).await?;
    issue_jwt(user.id, &user.email, &state.config.jwt_secret)
}

/// Apple sends `{"name": {"firstName": "..", "lastName": ".."}}` once
fn apple_user_name(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let name = value.get("name")?;
    let parts: Vec<&str> = ["firstName", "lastName"]
        .iter()
        .filter_map(|key| name.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apple_user_name() {
        assert_eq!(
            apple_user_name(r#"{"name":{"firstName":"Ada","lastName":"Lovelace"}}"#),
            Some("Ada Lovelace".to_string())
        );
        assert_eq!(
            apple_user_name(r#"{"name":{"firstName":"Ada"}}"#),
            Some("Ada".to_string())
        );
        assert_eq!(apple_user_name(r#"{"email":"a@b.co"}"#), None);
        assert_eq!(apple_user_name("not json"), None);
    }

    #[test]
    fn test_check_nonce() {
        assert!(check_nonce(Some("abc123"), "abc123").is_ok());
        assert!(matches!(
            check_nonce(Some("abc123"), "other"),
            Err(AppError::InvalidToken)
        ));
        assert!(matches!(check_nonce(None, "abc123"), Err(AppError::InvalidToken)));
        assert!(matches!(check_nonce(Some(""), ""), Err(AppError::InvalidToken)));
    }
}
