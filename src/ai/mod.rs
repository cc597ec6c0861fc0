//! Natural-language event parsing and meeting time suggestions.

pub mod client;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub use client::LlmClient;

use crate::constants::DEFAULT_EVENT_DURATION_MINS;
use crate::error::{AppError, Result};
use crate::models::Event;

const PARSE_EVENT_PROMPT: &str = "You turn a sentence describing a calendar event into JSON. \
Reply with one JSON object with the keys title, start_time, end_time, location and description. \
Times are ISO 8601 with a UTC offset. Use null for anything not mentioned.";

const SUGGEST_TIMES_PROMPT: &str = "You schedule meetings. Given busy intervals, propose free slots \
of the requested length inside the window, during reasonable working hours of the user's timezone. \
Reply with one JSON object {\"suggestions\": [{\"start_time\", \"end_time\", \"reason\"}]} \
with at most five suggestions. Times are ISO 8601 with a UTC offset.";

/// Event details extracted from free text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedEvent {
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub location: Option<String>,
    pub description: Option<String>,
}

/// A proposed slot for a meeting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSuggestion {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub reason: String,
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Accepts RFC 3339; a time without offset is taken as UTC
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M"))
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn time_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    text_field(value, key).as_deref().and_then(parse_time)
}

/// Validate the model's event object
///
/// `title` and `start_time` are required. A missing or unusable `end_time`
/// becomes start plus one hour.
pub fn parsed_event_from(value: &Value) -> Result<ParsedEvent> {
    let title = text_field(value, "title")
        .ok_or_else(|| AppError::AiResponse(format!("missing title: {}", value)))?;
    let start_time = time_field(value, "start_time")
        .ok_or_else(|| AppError::AiResponse(format!("missing or invalid start_time: {}", value)))?;

    let end_time = time_field(value, "end_time")
        .filter(|end| *end > start_time)
        .unwrap_or_else(|| start_time + Duration::minutes(DEFAULT_EVENT_DURATION_MINS));

    Ok(ParsedEvent {
        title,
        start_time,
        end_time,
        location: text_field(value, "location"),
        description: text_field(value, "description"),
    })
}

/// Validate the model's suggestions, keeping only usable slots
pub fn suggestions_from(value: &Value, duration: Duration) -> Result<Vec<TimeSuggestion>> {
    let items = value
        .get("suggestions")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::AiResponse(format!("missing suggestions: {}", value)))?;

    let suggestions = items
        .iter()
        .filter_map(|item| {
            let start_time = time_field(item, "start_time")?;
            let end_time = time_field(item, "end_time")
                .filter(|end| *end > start_time)
                .unwrap_or(start_time + duration);
            Some(TimeSuggestion {
                start_time,
                end_time,
                reason: text_field(item, "reason").unwrap_or_default(),
            })
        })
        .collect();

    Ok(suggestions)
}

/// Parse a sentence such as "lunch with Sam tomorrow at noon"
pub async fn parse_event(
    llm: &LlmClient,
    text: &str,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<ParsedEvent> {
    let prompt = format!(
        "Current time: {}\nUser timezone: {}\nText: {}",
        now.to_rfc3339(),
        timezone,
        text
    );

    let value = llm.chat_json(PARSE_EVENT_PROMPT, &prompt).await?;
    parsed_event_from(&value)
}

/// Ask for free slots around the user's existing events
pub async fn suggest_times(
    llm: &LlmClient,
    busy: &[Event],
    duration: Duration,
    window: (DateTime<Utc>, DateTime<Utc>),
    timezone: &str,
    preferences: Option<&str>,
) -> Result<Vec<TimeSuggestion>> {
    let mut prompt = format!(
        "Window: {} to {}\nUser timezone: {}\nMeeting length: {} minutes\n",
        window.0.to_rfc3339(),
        window.1.to_rfc3339(),
        timezone,
        duration.num_minutes()
    );
    if let Some(preferences) = preferences {
        prompt.push_str(&format!("Preferences: {}\n", preferences));
    }
    prompt.push_str("Busy:\n");
    for event in busy {
        prompt.push_str(&format!(
            "- {} to {}\n",
            event.start_time.to_rfc3339(),
            event.end_time.to_rfc3339()
        ));
    }

    let value = llm.chat_json(SUGGEST_TIMES_PROMPT, &prompt).await?;
    let suggestions = suggestions_from(&value, duration)?;

    tracing::debug!("Assistant proposed {} slots", suggestions.len());
    Ok(suggestions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parsed_event_defaults_end_time() {
        let event = parsed_event_from(&json!({
            "title": "Lunch with Sam",
            "start_time": "2026-10-19T12:00:00+02:00",
            "end_time": null,
            "location": "Cafe"
        }))
        .unwrap();

        assert_eq!(event.start_time, Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap());
        assert_eq!(event.end_time - event.start_time, Duration::hours(1));
        assert_eq!(event.location.as_deref(), Some("Cafe"));
        assert_eq!(event.description, None);
    }

    #[test]
    fn test_parsed_event_ignores_end_before_start() {
        let event = parsed_event_from(&json!({
            "title": "Call",
            "start_time": "2026-10-19T15:00:00Z",
            "end_time": "2026-10-19T14:00:00Z"
        }))
        .unwrap();

        assert_eq!(event.end_time, Utc.with_ymd_and_hms(2026, 10, 19, 16, 0, 0).unwrap());
    }

    #[test]
    fn test_parsed_event_requires_title_and_start() {
        assert!(matches!(
            parsed_event_from(&json!({"start_time": "2026-10-19T15:00:00Z"})),
            Err(AppError::AiResponse(_))
        ));
        assert!(matches!(
            parsed_event_from(&json!({"title": "Call", "start_time": "tomorrow"})),
            Err(AppError::AiResponse(_))
        ));
    }

    #[test]
    fn test_naive_times_are_utc() {
        assert_eq!(
            parse_time("2026-10-19T09:30"),
            Some(Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_suggestions_from() {
        let suggestions = suggestions_from(
            &json!({"suggestions": [
                {"start_time": "2026-10-20T09:00:00Z", "end_time": "2026-10-20T09:30:00Z", "reason": "Morning is free"},
                {"start_time": "2026-10-20T14:00:00Z"},
                {"start_time": "soon"}
            ]}),
            Duration::minutes(30),
        )
        .unwrap();

        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[1].end_time - suggestions[1].start_time, Duration::minutes(30));
        assert_eq!(suggestions[1].reason, "");

        assert!(suggestions_from(&json!({"slots": []}), Duration::minutes(30)).is_err());
    }
}
