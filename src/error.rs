use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::constants::{ERR_AI_PARSE, ERR_INVALID_OR_EXPIRED_TOKEN};

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Upstream request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream service error: {0}")]
    Upstream(String),

    #[error("Token signing error: {0}")]
    TokenSigning(#[from] jsonwebtoken::errors::Error),

    #[error("Password hashing error: {0}")]
    PasswordHash(String),

    #[error("AI response error: {0}")]
    AiResponse(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Usage limit reached: {0}")]
    UsageLimitExceeded(&'static str),

    #[error("Not found: {0}")]
    NotFound(&'static str),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// Implement IntoResponse to convert AppError into HTTP responses
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::Http(ref e) => {
                tracing::error!("Upstream request error: {:?}", e);
                (StatusCode::BAD_GATEWAY, "Upstream service error".to_string())
            }
            AppError::Upstream(ref msg) => {
                tracing::error!("Upstream service error: {}", msg);
                (StatusCode::BAD_GATEWAY, "Upstream service error".to_string())
            }
            AppError::TokenSigning(ref e) => {
                tracing::error!("Token signing error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::PasswordHash(ref msg) => {
                tracing::error!("Password hashing error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::AiResponse(ref msg) => {
                tracing::error!("AI response error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, ERR_AI_PARSE.to_string())
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "Invalid email or password".to_string(),
            ),
            AppError::InvalidToken => (
                StatusCode::BAD_REQUEST,
                ERR_INVALID_OR_EXPIRED_TOKEN.to_string(),
            ),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::UsageLimitExceeded(metric) => (
                StatusCode::FORBIDDEN,
                format!("Usage limit reached for {} this month", metric),
            ),
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::InvalidSignature => {
                (StatusCode::BAD_REQUEST, "Invalid signature".to_string())
            }
            AppError::NotConfigured(what) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{} is not configured", what),
            ),
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

/// Result type alias for application results
pub type Result<T> = std::result::Result<T, AppError>;

/// Report a unique-constraint violation as 409 with `message`
pub fn conflict_on_unique(err: sqlx::Error, message: &str) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return AppError::Conflict(message.to_string());
        }
    }
    AppError::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::Unauthorized, StatusCode::UNAUTHORIZED),
            (AppError::InvalidToken, StatusCode::BAD_REQUEST),
            (AppError::NotFound("Event"), StatusCode::NOT_FOUND),
            (AppError::UsageLimitExceeded("events"), StatusCode::FORBIDDEN),
            (AppError::NotConfigured("Stripe"), StatusCode::SERVICE_UNAVAILABLE),
            (AppError::AiResponse("bad".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_conflict_on_unique_passes_other_errors_through() {
        assert!(matches!(
            conflict_on_unique(sqlx::Error::RowNotFound, "User already exists"),
            AppError::Database(sqlx::Error::RowNotFound)
        ));
    }
}
