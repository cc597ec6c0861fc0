//! OAuth2 authorization-code plumbing shared by social login and calendar
//! connections.
//!
//! Only the token endpoint and userinfo calls are made here; the consent page
//! itself is the provider's.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::config::{Config, OAuthCredentials};
use crate::constants::DEFAULT_PROVIDER_TOKEN_TTL_SECS;
use crate::error::{AppError, Result};

/// Identity providers accepted for sign-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
    Microsoft,
    Apple,
    Yahoo,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Microsoft => "microsoft",
            OAuthProvider::Apple => "apple",
            OAuthProvider::Yahoo => "yahoo",
        }
    }

    pub fn credentials<'a>(&self, config: &'a Config) -> Option<&'a OAuthCredentials> {
        match self {
            OAuthProvider::Google => config.google.as_ref(),
            OAuthProvider::Microsoft => config.microsoft.as_ref(),
            OAuthProvider::Apple => config.apple.as_ref(),
            OAuthProvider::Yahoo => config.yahoo.as_ref(),
        }
    }

    pub fn authorize_url(&self, microsoft_tenant: &str) -> String {
        match self {
            OAuthProvider::Google => "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            OAuthProvider::Microsoft => format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/authorize",
                microsoft_tenant
            ),
            OAuthProvider::Apple => "https://appleid.apple.com/auth/authorize".to_string(),
            OAuthProvider::Yahoo => "https://api.login.yahoo.com/oauth2/request_auth".to_string(),
        }
    }

    pub fn token_url(&self, microsoft_tenant: &str) -> String {
        match self {
            OAuthProvider::Google => "https://oauth2.googleapis.com/token".to_string(),
            OAuthProvider::Microsoft => format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                microsoft_tenant
            ),
            OAuthProvider::Apple => "https://appleid.apple.com/auth/token".to_string(),
            OAuthProvider::Yahoo => "https://api.login.yahoo.com/oauth2/get_token".to_string(),
        }
    }

    /// Userinfo endpoint; Apple has none and identifies users via `id_token`
    pub fn userinfo_url(&self) -> Option<&'static str> {
        match self {
            OAuthProvider::Google => Some("https://openidconnect.googleapis.com/v1/userinfo"),
            OAuthProvider::Microsoft => Some("https://graph.microsoft.com/v1.0/me"),
            OAuthProvider::Apple => None,
            OAuthProvider::Yahoo => Some("https://api.login.yahoo.com/openid/v1/userinfo"),
        }
    }

    pub fn login_scopes(&self) -> &'static str {
        match self {
            OAuthProvider::Google | OAuthProvider::Yahoo => "openid email profile",
            OAuthProvider::Microsoft => "openid email profile offline_access User.Read",
            OAuthProvider::Apple => "name email",
        }
    }

    /// Extra authorize parameters; Apple posts the callback when scopes are requested
    pub fn login_params(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            OAuthProvider::Apple => &[("response_mode", "form_post")],
            OAuthProvider::Google => &[("prompt", "select_account")],
            _ => &[],
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OAuthProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(OAuthProvider::Google),
            "microsoft" | "outlook" => Ok(OAuthProvider::Microsoft),
            "apple" => Ok(OAuthProvider::Apple),
            "yahoo" => Ok(OAuthProvider::Yahoo),
            other => Err(format!("unknown identity provider: {}", other)),
        }
    }
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub id_token: Option<String>,
}

impl OAuthTokens {
    /// Absolute expiry, assuming one hour when the provider gives none
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in.unwrap_or(DEFAULT_PROVIDER_TOKEN_TTL_SECS))
    }
}

/// Who the provider says the user is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthIdentity {
    pub provider_user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Build the consent page URL
pub fn authorization_url(
    authorize_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: &str,
    extra: &[(&str, &str)],
) -> Result<String> {
    let mut params = vec![
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("response_type", "code"),
        ("scope", scope),
        ("state", state),
    ];
    params.extend_from_slice(extra);

    Url::parse_with_params(authorize_url, &params)
        .map(String::from)
        .map_err(|e| AppError::InvalidInput(format!("Invalid authorize URL: {}", e)))
}

/// Exchange an authorization code for tokens
pub async fn exchange_code(
    http: &Client,
    token_url: &str,
    credentials: &OAuthCredentials,
    code: &str,
    redirect_uri: &str,
) -> Result<OAuthTokens> {
    request_tokens(
        http,
        token_url,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
        ],
    )
    .await
}

/// Trade a refresh token for a new access token
pub async fn refresh_access_token(
    http: &Client,
    token_url: &str,
    credentials: &OAuthCredentials,
    refresh_token: &str,
) -> Result<OAuthTokens> {
    request_tokens(
        http,
        token_url,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
        ],
    )
    .await
}

async fn request_tokens(http: &Client, token_url: &str, form: &[(&str, &str)]) -> Result<OAuthTokens> {
    let response = http
        .post(token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(AppError::Upstream(format!(
            "Token endpoint error ({}): {}",
            status, error_text
        )));
    }

    response
        .json::<OAuthTokens>()
        .await
        .map_err(|e| AppError::Upstream(format!("Failed to parse token response: {}", e)))
}

/// Resolve the signed-in identity for a login provider
pub async fn fetch_identity(
    http: &Client,
    provider: OAuthProvider,
    tokens: &OAuthTokens,
) -> Result<OAuthIdentity> {
    let Some(userinfo_url) = provider.userinfo_url() else {
        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| AppError::Upstream(format!("{} returned no id_token", provider)))?;
        return identity_from_claims(provider, &id_token_claims(id_token)?);
    };

    let response = http
        .get(userinfo_url)
        .bearer_auth(&tokens.access_token)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(AppError::Upstream(format!(
            "{} userinfo error ({}): {}",
            provider, status, error_text
        )));
    }

    let body: Value = response.json().await?;
    identity_from_claims(provider, &body)
}

/// Map a userinfo document (or id_token claims) onto an identity
pub fn identity_from_claims(provider: OAuthProvider, claims: &Value) -> Result<OAuthIdentity> {
    let text = |key: &str| {
        claims
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };

    let identity = match provider {
        OAuthProvider::Microsoft => OAuthIdentity {
            provider_user_id: text("id").or_else(|| text("oid")).unwrap_or_default(),
            email: text("mail").or_else(|| text("userPrincipalName")),
            name: text("displayName"),
            avatar_url: None,
        },
        OAuthProvider::Google | OAuthProvider::Yahoo | OAuthProvider::Apple => OAuthIdentity {
            provider_user_id: text("sub").unwrap_or_default(),
            email: text("email"),
            name: text("name"),
            avatar_url: text("picture"),
        },
    };

    if identity.provider_user_id.is_empty() {
        return Err(AppError::Upstream(format!(
            "{} identity has no subject",
            provider
        )));
    }

    Ok(identity)
}

/// Read the claims of an `id_token` received directly from the token endpoint
///
/// The token arrives over the TLS connection we opened to the provider, so
/// only its payload is decoded.
pub fn id_token_claims(id_token: &str) -> Result<Value> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| AppError::Upstream("Malformed id_token".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AppError::Upstream(format!("Malformed id_token payload: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| AppError::Upstream(format!("Malformed id_token claims: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_parsing() {
        assert_eq!("google".parse::<OAuthProvider>(), Ok(OAuthProvider::Google));
        assert_eq!("Apple".parse::<OAuthProvider>(), Ok(OAuthProvider::Apple));
        assert_eq!("outlook".parse::<OAuthProvider>(), Ok(OAuthProvider::Microsoft));
        assert!("github".parse::<OAuthProvider>().is_err());
    }

    #[test]
    fn test_authorization_url() {
        let url = authorization_url(
            &OAuthProvider::Microsoft.authorize_url("common"),
            "client-123",
            "http://localhost:8080/api/auth/oauth/microsoft/callback",
            OAuthProvider::Microsoft.login_scopes(),
            "state-token",
            &[("prompt", "consent")],
        )
        .unwrap();

        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("login.microsoftonline.com"));
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".into(), "client-123".into())));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        assert!(pairs.contains(&("state".into(), "state-token".into())));
        assert!(pairs.contains(&("prompt".into(), "consent".into())));
        assert!(pairs.contains(&(
            "redirect_uri".into(),
            "http://localhost:8080/api/auth/oauth/microsoft/callback".into()
        )));
    }

    #[test]
    fn test_token_expiry_defaults_to_one_hour() {
        let now = Utc::now();
        let tokens = OAuthTokens {
            access_token: "at".into(),
            refresh_token: None,
            expires_in: None,
            id_token: None,
        };
        assert_eq!(tokens.expires_at(now), now + Duration::hours(1));

        let tokens = OAuthTokens {
            expires_in: Some(120),
            ..tokens
        };
        assert_eq!(tokens.expires_at(now), now + Duration::seconds(120));
    }

    #[test]
    fn test_identity_from_google_userinfo() {
        let identity = identity_from_claims(
            OAuthProvider::Google,
            &json!({
                "sub": "10987",
                "email": "ada@example.com",
                "name": "Ada Lovelace",
                "picture": "https://example.com/ada.png"
            }),
        )
        .unwrap();

        assert_eq!(identity.provider_user_id, "10987");
        assert_eq!(identity.email.as_deref(), Some("ada@example.com"));
        assert_eq!(identity.avatar_url.as_deref(), Some("https://example.com/ada.png"));
    }

    #[test]
    fn test_identity_from_graph_me() {
        let identity = identity_from_claims(
            OAuthProvider::Microsoft,
            &json!({
                "id": "abc-def",
                "mail": null,
                "userPrincipalName": "ada@contoso.com",
                "displayName": "Ada"
            }),
        )
        .unwrap();

        assert_eq!(identity.provider_user_id, "abc-def");
        assert_eq!(identity.email.as_deref(), Some("ada@contoso.com"));
        assert_eq!(identity.name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_identity_requires_subject() {
        assert!(identity_from_claims(OAuthProvider::Yahoo, &json!({"email": "a@b.co"})).is_err());
    }

    #[test]
    fn test_id_token_claims() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","kid":"k"}"#);
        let payload = URL_SAFE_NO_PAD
            .encode(br#"{"sub":"001234.apple","email":"ada@privaterelay.appleid.com"}"#);
        let token = format!("{}.{}.signature", header, payload);

        let claims = id_token_claims(&token).unwrap();
        let identity = identity_from_claims(OAuthProvider::Apple, &claims).unwrap();
        assert_eq!(identity.provider_user_id, "001234.apple");
        assert_eq!(
            identity.email.as_deref(),
            Some("ada@privaterelay.appleid.com")
        );

        assert!(id_token_claims("not-a-jwt").is_err());
    }
}
