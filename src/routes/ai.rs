use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use super::calendar::{insert_event, CreateEventRequest, EventDetail};
use super::validation::non_blank;
use crate::ai::{self, LlmClient, ParsedEvent, TimeSuggestion};
use crate::auth::accounts::find_user;
use crate::auth::AuthUser;
use crate::billing::usage::{record_usage, UsageMetric};
use crate::constants::MAX_SUGGESTION_DAYS;
use crate::error::{AppError, Result};
use crate::models::{Event, EventSource};
use crate::AppState;

const DEFAULT_SUGGESTION_DAYS: i64 = 7;
const MIN_MEETING_MINUTES: i64 = 5;
const MAX_MEETING_MINUTES: i64 = 8 * 60;
const MAX_TEXT_LENGTH: usize = 2_000;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/parse-event", post(parse_event))
        .route("/create-event", post(create_event))
        .route("/suggest-times", post(suggest_times))
}

#[derive(Debug, Deserialize)]
pub struct ParseEventRequest {
    pub text: String,
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SuggestTimesRequest {
    pub duration_minutes: i64,
    pub days_ahead: Option<i64>,
    pub preferences: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SuggestTimesResponse {
    pub suggestions: Vec<TimeSuggestion>,
}

/// Check the key, then spend one AI request from the monthly allowance
async fn metered_client(state: &AppState, user: &AuthUser) -> Result<LlmClient> {
    let llm = LlmClient::from_state(state)?;

    let mut conn = state.pool.acquire().await?;
    record_usage(&mut *conn, user.id, UsageMetric::AiRequests).await?;

    Ok(llm)
}

/// Request timezone, else the user's profile timezone
async fn timezone_for(state: &AppState, user: &AuthUser, requested: Option<String>) -> Result<String> {
    match non_blank(requested) {
        Some(tz) => Ok(tz),
        None => Ok(find_user(&state.pool, user.id).await?.timezone),
    }
}

fn validate_text(text: &str) -> Result<()> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AppError::InvalidInput("text is required".to_string()));
    }
    if text.chars().count() > MAX_TEXT_LENGTH {
        return Err(AppError::InvalidInput(format!(
            "text must be at most {} characters",
            MAX_TEXT_LENGTH
        )));
    }
    Ok(())
}

async fn parse(state: &AppState, user: &AuthUser, payload: ParseEventRequest) -> Result<ParsedEvent> {
    validate_text(&payload.text)?;
    let llm = metered_client(state, user).await?;
    let timezone = timezone_for(state, user, payload.timezone).await?;

    ai::parse_event(&llm, payload.text.trim(), &timezone, Utc::now()).await
}

pub async fn parse_event(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ParseEventRequest>,
) -> Result<Json<ParsedEvent>> {
    Ok(Json(parse(&state, &user, payload).await?))
}

/// Parse the text and store the result as an event
pub async fn create_event(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ParseEventRequest>,
) -> Result<(StatusCode, Json<EventDetail>)> {
    let parsed = parse(&state, &user, payload).await?;

    let request = CreateEventRequest {
        title: parsed.title,
        description: parsed.description,
        location: parsed.location,
        start_time: parsed.start_time,
        end_time: parsed.end_time,
        all_day: false,
        color: None,
        attendees: Vec::new(),
    };

    let mut tx = state.pool.begin().await?;
    let detail = insert_event(&mut tx, user.id, request, EventSource::Ai).await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn suggest_times(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<SuggestTimesRequest>,
) -> Result<Json<SuggestTimesResponse>> {
    if !(MIN_MEETING_MINUTES..=MAX_MEETING_MINUTES).contains(&payload.duration_minutes) {
        return Err(AppError::InvalidInput(format!(
            "duration_minutes must be between {} and {}",
            MIN_MEETING_MINUTES, MAX_MEETING_MINUTES
        )));
    }
    let days = payload
        .days_ahead
        .unwrap_or(DEFAULT_SUGGESTION_DAYS)
        .clamp(1, MAX_SUGGESTION_DAYS);

    let llm = metered_client(&state, &user).await?;
    let timezone = timezone_for(&state, &user, None).await?;

    let start = Utc::now();
    let end = start + Duration::days(days);
    let busy = sqlx::query_as::<_, Event>(
        r#"
        SELECT * FROM events
        WHERE user_id = $1 AND end_time > $2 AND start_time < $3
        ORDER BY start_time
        "#,
    )
    .bind(user.id)
    .bind(start)
    .bind(end)
    .fetch_all(&state.pool)
    .await?;

    let suggestions = ai::suggest_times(
        &llm,
        &busy,
        Duration::minutes(payload.duration_minutes),
        (start, end),
        &timezone,
        non_blank(payload.preferences).as_deref(),
    )
    .await?;

    Ok(Json(SuggestTimesResponse { suggestions }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_text() {
        assert!(validate_text("lunch tomorrow at noon").is_ok());
        assert!(validate_text("   ").is_err());
        assert!(validate_text(&"x".repeat(MAX_TEXT_LENGTH + 1)).is_err());
    }
}
