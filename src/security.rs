use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::constants::{JWT_TTL_SECS, MAX_TIMESTAMP_AGE_SECS, OAUTH_STATE_TTL_SECS, TOKEN_BYTES};
use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Passwords
// =============================================================================

/// Hash a password with Argon2id and a fresh random salt (PHC string format)
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::PasswordHash(e.to_string()))
}

/// Check a password against a stored PHC hash
///
/// A malformed stored hash counts as a mismatch.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("Stored password hash is malformed: {}", e);
            false
        }
    }
}

// =============================================================================
// Session tokens
// =============================================================================

/// Claims carried by the session JWT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issue a 7-day HS256 session token for a user
pub fn issue_jwt(user_id: Uuid, email: &str, secret: &str) -> Result<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        iat: now,
        exp: now + JWT_TTL_SECS,
    };

    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Validate signature and expiry of a session token
pub fn verify_jwt(token: &str, secret: &str) -> Result<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        tracing::debug!("Rejected session token: {}", e);
        AppError::Unauthorized
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct StateClaims {
    sub: String,
    purpose: String,
    exp: i64,
}

/// Sign the `state` parameter of an OAuth redirect
///
/// `purpose` binds the state to one flow (e.g. `login:google`), `subject`
/// carries whatever the callback needs back (a nonce or a user id).
pub fn issue_state_token(purpose: &str, subject: &str, secret: &str) -> Result<String> {
    let claims = StateClaims {
        sub: subject.to_string(),
        purpose: purpose.to_string(),
        exp: Utc::now().timestamp() + OAUTH_STATE_TTL_SECS,
    };

    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Verify an OAuth `state` and return its subject
pub fn verify_state_token(token: &str, purpose: &str, secret: &str) -> Result<String> {
    let claims = decode::<StateClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::warn!("Rejected OAuth state: {}", e);
        AppError::InvalidToken
    })?
    .claims;

    if claims.purpose != purpose {
        tracing::warn!(
            "OAuth state purpose mismatch: expected {}, got {}",
            purpose,
            claims.purpose
        );
        return Err(AppError::InvalidToken);
    }

    Ok(claims.sub)
}

/// Random hex token for email verification and password reset links
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// =============================================================================
// Webhook signatures
// =============================================================================

/// Verify a hex-encoded HMAC-SHA256 signature in constant time
pub fn verify_hmac(data: &[u8], signature: &str, secret: &str) -> bool {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            tracing::error!("Failed to create HMAC instance");
            return false;
        }
    };

    mac.update(data);

    let sig_bytes = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => {
            tracing::warn!("Invalid hex signature format");
            return false;
        }
    };

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Validate timestamp is within acceptable range
///
/// Prevents replay attacks by ensuring the request is recent.
pub fn validate_timestamp(timestamp: i64, max_age_secs: i64) -> bool {
    let now = Utc::now().timestamp();
    let age_seconds = (now - timestamp).abs();

    if age_seconds > max_age_secs {
        tracing::warn!(
            "Timestamp too old: {} seconds (max: {})",
            age_seconds,
            max_age_secs
        );
        return false;
    }

    true
}

/// Verify a `Stripe-Signature` header against the raw request body
///
/// The header looks like `t=1700000000,v1=<hex>,v1=<hex>,v0=<hex>`. The
/// signed payload is `"{t}.{body}"`; any `v1` entry may match.
pub fn verify_stripe_signature(payload: &[u8], header: &str, secret: &str) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        tracing::warn!("Stripe signature header has no timestamp");
        return false;
    };

    if signatures.is_empty() {
        tracing::warn!("Stripe signature header has no v1 signature");
        return false;
    }

    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);

    if !signatures
        .iter()
        .any(|signature| verify_hmac(&signed, signature, secret))
    {
        tracing::warn!("Stripe signature mismatch");
        return false;
    }

    validate_timestamp(timestamp, MAX_TIMESTAMP_AGE_SECS)
}
