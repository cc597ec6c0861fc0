pub mod accounts;
pub mod oauth;
pub mod tokens;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use uuid::Uuid;

use crate::error::AppError;
use crate::security::verify_jwt;
use crate::AppState;

/// Authenticated caller, extracted from `Authorization: Bearer <jwt>`
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AppError::Unauthorized)?;

        let claims = verify_jwt(token, &state.config.jwt_secret)?;

        Ok(AuthUser {
            id: claims.sub,
            email: claims.email,
        })
    }
}
