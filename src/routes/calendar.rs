use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use super::auth::MessageResponse;
use super::validation::non_blank;
use crate::auth::AuthUser;
use crate::billing::usage::{record_usage, UsageMetric};
use crate::error::{AppError, Result};
use crate::models::{Attendee, Event, EventSource, NewAttendee};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/events", get(list_events).post(create_event))
        .route("/events/search", get(search_events))
        .route(
            "/events/:id",
            get(get_event).put(update_event).delete(delete_event),
        )
        .route("/stats", get(stats))
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEventRequest {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    pub color: Option<String>,
    #[serde(default)]
    pub attendees: Vec<NewAttendee>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEventRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub all_day: Option<bool>,
    pub color: Option<String>,
}

/// Event together with its attendees
#[derive(Debug, Serialize)]
pub struct EventDetail {
    #[serde(flatten)]
    pub event: Event,
    pub attendees: Vec<Attendee>,
}

#[derive(Debug, Serialize)]
pub struct CalendarStats {
    pub total: i64,
    pub upcoming: i64,
    pub this_week: i64,
    pub by_source: HashMap<String, i64>,
}

pub async fn list_events(
    State(state): State<AppState>,
    user: AuthUser,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<Event>>> {
    if let (Some(start), Some(end)) = (range.start, range.end) {
        if end < start {
            return Err(AppError::InvalidInput("end must not be before start".to_string()));
        }
    }

    // Overlap: an event belongs to the range if any part of it falls inside
    let events = sqlx::query_as::<_, Event>(
        r#"
        SELECT * FROM events
        WHERE user_id = $1
          AND ($2::TIMESTAMPTZ IS NULL OR end_time > $2)
          AND ($3::TIMESTAMPTZ IS NULL OR start_time < $3)
        ORDER BY start_time
        "#,
    )
    .bind(user.id)
    .bind(range.start)
    .bind(range.end)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(events))
}

/// Create an event on behalf of `user_id`, metered against the plan
///
/// Shared by the calendar and assistant endpoints. The caller owns the
/// transaction so the usage counter and the rows commit together.
pub async fn insert_event(
    conn: &mut PgConnection,
    user_id: Uuid,
    request: CreateEventRequest,
    source: EventSource,
) -> Result<EventDetail> {
    Event::validate_title(&request.title)?;
    Event::validate_time_range(request.start_time, request.end_time)?;
    for attendee in &request.attendees {
        if !attendee.email.contains('@') {
            return Err(AppError::InvalidInput(format!(
                "Invalid attendee email: {}",
                attendee.email
            )));
        }
    }

    record_usage(&mut *conn, user_id, UsageMetric::EventsCreated).await?;

    let event = sqlx::query_as::<_, Event>(
        r#"
        INSERT INTO events
            (id, user_id, title, description, location, start_time, end_time, all_day, color, source)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(request.title.trim())
    .bind(non_blank(request.description))
    .bind(non_blank(request.location))
    .bind(request.start_time)
    .bind(request.end_time)
    .bind(request.all_day)
    .bind(non_blank(request.color))
    .bind(source.as_str())
    .fetch_one(&mut *conn)
    .await?;

    let mut attendees = Vec::with_capacity(request.attendees.len());
    for attendee in request.attendees {
        let row = sqlx::query_as::<_, Attendee>(
            r#"
            INSERT INTO event_attendees (id, event_id, email, name, status)
            VALUES ($1, $2, $3, $4, COALESCE($5, 'needsAction'))
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.id)
        .bind(attendee.email.trim())
        .bind(attendee.name)
        .bind(attendee.status)
        .fetch_one(&mut *conn)
        .await?;
        attendees.push(row);
    }

    tracing::info!("Created {} event {} for user {}", source.as_str(), event.id, user_id);
    Ok(EventDetail { event, attendees })
}

pub async fn create_event(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateEventRequest>,
) -> Result<(StatusCode, Json<EventDetail>)> {
    Event::validate_title(&payload.title)?;
    Event::validate_time_range(payload.start_time, payload.end_time)?;

    let mut tx = state.pool.begin().await?;
    let detail = insert_event(&mut tx, user.id, payload, EventSource::Local).await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(detail)))
}

async fn load_attendees(state: &AppState, event_id: Uuid) -> Result<Vec<Attendee>> {
    let attendees = sqlx::query_as::<_, Attendee>(
        "SELECT * FROM event_attendees WHERE event_id = $1 ORDER BY email",
    )
    .bind(event_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(attendees)
}

pub async fn get_event(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<EventDetail>> {
    let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(user.id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or(AppError::NotFound("Event"))?;

    let attendees = load_attendees(&state, event.id).await?;
    Ok(Json(EventDetail { event, attendees }))
}

/// Partial update; the merged time range must still be valid
pub async fn update_event(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateEventRequest>,
) -> Result<Json<Event>> {
    if let Some(title) = &payload.title {
        Event::validate_title(title)?;
    }
    if let (Some(start), Some(end)) = (payload.start_time, payload.end_time) {
        Event::validate_time_range(start, end)?;
    }

    let mut tx = state.pool.begin().await?;

    let current = sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE id = $1 AND user_id = $2 FOR UPDATE",
    )
    .bind(id)
    .bind(user.id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(AppError::NotFound("Event"))?;

    let start_time = payload.start_time.unwrap_or(current.start_time);
    let end_time = payload.end_time.unwrap_or(current.end_time);
    Event::validate_time_range(start_time, end_time)?;

    let updated = sqlx::query_as::<_, Event>(
        r#"
        UPDATE events
        SET title = COALESCE($1, title),
            description = COALESCE($2, description),
            location = COALESCE($3, location),
            start_time = $4,
            end_time = $5,
            all_day = COALESCE($6, all_day),
            color = COALESCE($7, color),
            updated_at = NOW()
        WHERE id = $8
        RETURNING *
        "#,
    )
    .bind(payload.title.map(|t| t.trim().to_string()))
    .bind(payload.description)
    .bind(payload.location)
    .bind(start_time)
    .bind(end_time)
    .bind(payload.all_day)
    .bind(payload.color)
    .bind(current.id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Json(updated))
}

pub async fn delete_event(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>> {
    let removed = sqlx::query("DELETE FROM events WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(user.id)
        .execute(&state.pool)
        .await?
        .rows_affected();

    if removed == 0 {
        return Err(AppError::NotFound("Event"));
    }

    Ok(MessageResponse::ok("Event deleted"))
}

pub async fn search_events(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Event>>> {
    let term = query.q.trim();
    if term.is_empty() {
        return Err(AppError::InvalidInput("Search query is required".to_string()));
    }

    let pattern = format!("%{}%", escape_like(term));
    let events = sqlx::query_as::<_, Event>(
        r#"
        SELECT * FROM events
        WHERE user_id = $1
          AND (title ILIKE $2 OR description ILIKE $2 OR location ILIKE $2)
        ORDER BY start_time
        LIMIT 100
        "#,
    )
    .bind(user.id)
    .bind(pattern)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(events))
}

/// Escape LIKE wildcards so user input matches literally
pub(crate) fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub async fn stats(State(state): State<AppState>, user: AuthUser) -> Result<Json<CalendarStats>> {
    let now = Utc::now();
    let week_end = now + Duration::days(7);

    let (total, upcoming, this_week): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE start_time >= $2),
            COUNT(*) FILTER (WHERE start_time >= $2 AND start_time < $3)
        FROM events
        WHERE user_id = $1
        "#,
    )
    .bind(user.id)
    .bind(now)
    .bind(week_end)
    .fetch_one(&state.pool)
    .await?;

    let by_source: Vec<(String, i64)> = sqlx::query_as(
        "SELECT source, COUNT(*) FROM events WHERE user_id = $1 GROUP BY source",
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(CalendarStats {
        total,
        upcoming,
        this_week,
        by_source: by_source.into_iter().collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("standup"), "standup");
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateEventRequest = serde_json::from_value(serde_json::json!({
            "title": "Standup",
            "start_time": "2026-10-19T09:00:00Z",
            "end_time": "2026-10-19T09:15:00Z"
        }))
        .unwrap();

        assert!(!request.all_day);
        assert!(request.attendees.is_empty());
        assert!(request.description.is_none());
    }
}
