//! Calendar provider clients (Google Calendar v3, Microsoft Graph)

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::auth::oauth::{self, OAuthProvider, OAuthTokens};
use crate::config::OAuthCredentials;
use crate::error::{AppError, Result};
use crate::models::{NewAttendee, SyncProvider};
use crate::routes::validation::non_blank;

const GOOGLE_CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const MICROSOFT_GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const OUTLOOK_TIMEZONE_HEADER: &str = r#"outlook.timezone="UTC""#;
const GOOGLE_PAGE_SIZE: &str = "250";
const OUTLOOK_PAGE_SIZE: &str = "50";

/// Event as read from a provider, normalized to UTC
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEvent {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub all_day: bool,
    pub attendees: Vec<NewAttendee>,
}

/// One page of provider results
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<FetchedEvent>,
    /// Opaque cursor for the next page, `None` on the last one
    pub next_page: Option<String>,
}

/// Time range pulled on each sync
#[derive(Debug, Clone, Copy)]
pub struct FetchWindow {
    pub time_min: DateTime<Utc>,
    pub time_max: DateTime<Utc>,
}

/// Operations the sync engine needs from a calendar provider
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    fn kind(&self) -> SyncProvider;

    /// Fetch one page of events in `window`
    async fn fetch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        window: FetchWindow,
        page: Option<&str>,
    ) -> Result<EventPage>;

    /// Refresh an access token using a refresh token
    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens>;
}

/// Send a provider request and decode the JSON body
async fn get_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    provider: SyncProvider,
) -> Result<T> {
    let response = request.send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(AppError::Upstream(format!(
            "{} API error ({}): {}",
            provider, status, error_text
        )));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| AppError::Upstream(format!("Failed to parse {} response: {}", provider, e)))
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| AppError::Upstream(format!("Invalid provider URL {}: {}", raw, e)))
}

/// Drop events the calendar cannot store: no usable times, or not ending after the start
fn keep_storable(event: Option<FetchedEvent>, provider: SyncProvider) -> Option<FetchedEvent> {
    let event = event?;
    if event.end_time <= event.start_time {
        tracing::warn!(
            "Skipping {} event {}: end is not after start",
            provider,
            event.external_id
        );
        return None;
    }
    Some(event)
}

async fn refresh_with(
    http: &Client,
    token_url: &str,
    credentials: Option<&OAuthCredentials>,
    refresh_token: &str,
    provider: SyncProvider,
) -> Result<OAuthTokens> {
    let credentials = credentials.ok_or(AppError::NotConfigured("Calendar provider"))?;
    let tokens = oauth::refresh_access_token(http, token_url, credentials, refresh_token).await?;
    tracing::debug!("Refreshed {} access token", provider);
    Ok(tokens)
}

// =============================================================================
// Google
// =============================================================================

/// Google Calendar `events.list`
#[derive(Clone)]
pub struct GoogleCalendarProvider {
    http: Client,
    credentials: Option<OAuthCredentials>,
    api_base: String,
    token_url: String,
}

impl GoogleCalendarProvider {
    pub fn new(http: Client, credentials: Option<OAuthCredentials>) -> Self {
        Self {
            http,
            credentials,
            api_base: GOOGLE_CALENDAR_API_BASE.to_string(),
            token_url: OAuthProvider::Google.token_url(""),
        }
    }

    /// Point the client at other endpoints (a local mock in tests)
    pub fn with_endpoints(mut self, api_base: &str, token_url: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.token_url = token_url.to_string();
        self
    }

    fn events_url(&self, calendar_id: &str) -> Result<Url> {
        let mut url = parse_url(&self.api_base)?;
        url.path_segments_mut()
            .map_err(|_| AppError::Upstream("Google API base cannot carry a path".to_string()))?
            .push("calendars")
            .push(calendar_id)
            .push("events");
        Ok(url)
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarProvider {
    fn kind(&self) -> SyncProvider {
        SyncProvider::Google
    }

    async fn fetch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        window: FetchWindow,
        page: Option<&str>,
    ) -> Result<EventPage> {
        let mut query = vec![
            ("timeMin", window.time_min.to_rfc3339()),
            ("timeMax", window.time_max.to_rfc3339()),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
            ("maxResults", GOOGLE_PAGE_SIZE.to_string()),
        ];
        if let Some(token) = page {
            query.push(("pageToken", token.to_string()));
        }

        let request = self
            .http
            .get(self.events_url(calendar_id)?)
            .bearer_auth(access_token)
            .query(&query);
        let response: GoogleEventsResponse = get_json(request, SyncProvider::Google).await?;

        let events = response
            .items
            .into_iter()
            .filter(|item| item.status.as_deref() != Some("cancelled"))
            .filter_map(|item| keep_storable(item.into_fetched(), SyncProvider::Google))
            .collect();

        Ok(EventPage {
            events,
            next_page: response.next_page_token,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens> {
        refresh_with(
            &self.http,
            &self.token_url,
            self.credentials.as_ref(),
            refresh_token,
            SyncProvider::Google,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct GoogleEventsResponse {
    #[serde(default)]
    items: Vec<GoogleCalendarEvent>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleCalendarEvent {
    id: String,
    status: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    start: Option<GoogleEventTime>,
    end: Option<GoogleEventTime>,
    #[serde(default)]
    attendees: Vec<GoogleAttendee>,
}

#[derive(Debug, Deserialize)]
struct GoogleEventTime {
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleAttendee {
    email: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "responseStatus")]
    response_status: Option<String>,
}

impl GoogleEventTime {
    /// Timed events carry `dateTime`; all-day events a bare `date`
    fn resolve(&self) -> Option<(DateTime<Utc>, bool)> {
        if let Some(value) = &self.date_time {
            let parsed = DateTime::parse_from_rfc3339(value).ok()?;
            return Some((parsed.with_timezone(&Utc), false));
        }
        let date = NaiveDate::parse_from_str(self.date.as_deref()?, "%Y-%m-%d").ok()?;
        Some((date.and_hms_opt(0, 0, 0)?.and_utc(), true))
    }
}

impl GoogleCalendarEvent {
    fn into_fetched(self) -> Option<FetchedEvent> {
        let (start_time, all_day) = self.start.as_ref().and_then(GoogleEventTime::resolve)?;
        let (end_time, _) = self.end.as_ref().and_then(GoogleEventTime::resolve)?;

        let attendees = self
            .attendees
            .into_iter()
            .filter_map(|a| {
                let email = non_blank(a.email)?;
                Some(NewAttendee {
                    email,
                    name: non_blank(a.display_name),
                    status: a.response_status,
                })
            })
            .collect();

        Some(FetchedEvent {
            external_id: self.id,
            title: non_blank(self.summary).unwrap_or_else(|| "(No title)".to_string()),
            description: non_blank(self.description),
            location: non_blank(self.location),
            start_time,
            end_time,
            all_day,
            attendees,
        })
    }
}

// =============================================================================
// Outlook
// =============================================================================

/// Microsoft Graph `calendarView`
#[derive(Clone)]
pub struct OutlookCalendarProvider {
    http: Client,
    credentials: Option<OAuthCredentials>,
    api_base: String,
    token_url: String,
}

impl OutlookCalendarProvider {
    pub fn new(http: Client, credentials: Option<OAuthCredentials>, tenant: &str) -> Self {
        Self {
            http,
            credentials,
            api_base: MICROSOFT_GRAPH_API_BASE.to_string(),
            token_url: OAuthProvider::Microsoft.token_url(tenant),
        }
    }

    /// Point the client at other endpoints (a local mock in tests)
    pub fn with_endpoints(mut self, api_base: &str, token_url: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.token_url = token_url.to_string();
        self
    }

    fn calendar_view_url(&self, calendar_id: &str) -> Result<Url> {
        let mut url = parse_url(&self.api_base)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AppError::Upstream("Graph API base cannot carry a path".to_string()))?;
            segments.push("me");
            if !calendar_id.eq_ignore_ascii_case("primary") {
                segments.push("calendars").push(calendar_id);
            }
            segments.push("calendarView");
        }
        Ok(url)
    }
}

#[async_trait]
impl CalendarProvider for OutlookCalendarProvider {
    fn kind(&self) -> SyncProvider {
        SyncProvider::Outlook
    }

    async fn fetch_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        window: FetchWindow,
        page: Option<&str>,
    ) -> Result<EventPage> {
        // Graph hands out the next page as a complete URL
        let request = match page {
            Some(next_link) => self.http.get(parse_url(next_link)?),
            None => self.http.get(self.calendar_view_url(calendar_id)?).query(&[
                ("startDateTime", window.time_min.to_rfc3339()),
                ("endDateTime", window.time_max.to_rfc3339()),
                ("$top", OUTLOOK_PAGE_SIZE.to_string()),
            ]),
        };
        let request = request
            .bearer_auth(access_token)
            .header("Prefer", OUTLOOK_TIMEZONE_HEADER);

        let response: OutlookEventsResponse = get_json(request, SyncProvider::Outlook).await?;

        let events = response
            .value
            .into_iter()
            .filter(|item| !item.is_cancelled)
            .filter_map(|item| keep_storable(item.into_fetched(), SyncProvider::Outlook))
            .collect();

        Ok(EventPage {
            events,
            next_page: response.next_link,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens> {
        refresh_with(
            &self.http,
            &self.token_url,
            self.credentials.as_ref(),
            refresh_token,
            SyncProvider::Outlook,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct OutlookEventsResponse {
    #[serde(default)]
    value: Vec<OutlookEvent>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutlookEvent {
    id: String,
    subject: Option<String>,
    body_preview: Option<String>,
    location: Option<OutlookLocation>,
    start: OutlookDateTime,
    end: OutlookDateTime,
    #[serde(default)]
    is_all_day: bool,
    #[serde(default)]
    is_cancelled: bool,
    #[serde(default)]
    attendees: Vec<OutlookAttendee>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutlookLocation {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutlookDateTime {
    date_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutlookAttendee {
    email_address: OutlookEmailAddress,
    status: Option<OutlookResponseStatus>,
}

#[derive(Debug, Deserialize)]
struct OutlookEmailAddress {
    address: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutlookResponseStatus {
    response: Option<String>,
}

/// Graph returns `2026-10-19T09:00:00.0000000` in the zone asked for via `Prefer`
fn parse_graph_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

impl OutlookEvent {
    fn into_fetched(self) -> Option<FetchedEvent> {
        let start_time = parse_graph_time(&self.start.date_time)?;
        let end_time = parse_graph_time(&self.end.date_time)?;

        let attendees = self
            .attendees
            .into_iter()
            .filter_map(|a| {
                let email = non_blank(a.email_address.address)?;
                Some(NewAttendee {
                    email,
                    name: non_blank(a.email_address.name),
                    status: a.status.and_then(|s| s.response),
                })
            })
            .collect();

        Some(FetchedEvent {
            external_id: self.id,
            title: non_blank(self.subject).unwrap_or_else(|| "(No title)".to_string()),
            description: non_blank(self.body_preview),
            location: self.location.and_then(|l| non_blank(l.display_name)),
            start_time,
            end_time,
            all_day: self.is_all_day,
            attendees,
        })
    }
}
