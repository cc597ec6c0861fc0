/// Session JWT lifetime (7 days)
pub const JWT_TTL_SECS: i64 = 7 * 24 * 3600;

/// Lifetime of the signed `state` parameter used in OAuth redirects
pub const OAUTH_STATE_TTL_SECS: i64 = 600;

/// Email verification token lifetime (24 hours)
pub const EMAIL_VERIFICATION_TTL_SECS: i64 = 24 * 3600;

/// Password reset token lifetime (1 hour)
pub const PASSWORD_RESET_TTL_SECS: i64 = 3600;

/// Random bytes in verification and reset tokens (hex encoded to 64 chars)
pub const TOKEN_BYTES: usize = 32;

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Assumed provider token lifetime when the token response omits `expires_in`
pub const DEFAULT_PROVIDER_TOKEN_TTL_SECS: i64 = 3600;

/// Refresh a calendar access token when it expires within this margin
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Forward window pulled from calendar providers on every sync
pub const SYNC_WINDOW_DAYS: i64 = 30;

/// Upper bound on provider result pages followed per sync
pub const MAX_SYNC_PAGES: usize = 10;

/// Maximum age of a Stripe webhook signature timestamp (5 minutes)
/// Prevents replay attacks
pub const MAX_TIMESTAMP_AGE_SECS: i64 = 300;

/// Plan applied to users without a live subscription
pub const FREE_PLAN_ID: &str = "free";

/// Default length of an event parsed without an explicit end
pub const DEFAULT_EVENT_DURATION_MINS: i64 = 60;

/// Longest window the assistant looks at when proposing meeting times
pub const MAX_SUGGESTION_DAYS: i64 = 14;

// =============================================================================
// Error Messages
// =============================================================================

/// Returned for unknown, expired, or already used email/reset tokens
pub const ERR_INVALID_OR_EXPIRED_TOKEN: &str = "Invalid or expired token";

pub const ERR_END_BEFORE_START: &str = "end_time must be after start_time";

pub const ERR_AI_PARSE: &str = "Failed to parse AI response";
