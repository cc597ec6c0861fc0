//! Pulls events from connected Google and Outlook calendars.
//!
//! Every enabled connection is synced on a schedule. Events are stored with
//! upsert-if-absent on `(external_id, user_id)`: the first copy wins and
//! later upstream edits are not applied.

pub mod providers;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::oauth::OAuthProvider;
use crate::constants::{MAX_SYNC_PAGES, SYNC_WINDOW_DAYS, TOKEN_REFRESH_MARGIN_SECS};
use crate::error::{AppError, Result};
use crate::models::{CalendarSync, EventSource, SyncProvider};
use crate::AppState;

pub use providers::{
    CalendarProvider, EventPage, FetchWindow, FetchedEvent, GoogleCalendarProvider,
    OutlookCalendarProvider,
};

/// Identity provider whose OAuth app grants calendar access
pub fn oauth_provider(provider: SyncProvider) -> OAuthProvider {
    match provider {
        SyncProvider::Google => OAuthProvider::Google,
        SyncProvider::Outlook => OAuthProvider::Microsoft,
    }
}

/// Scopes requested when connecting a calendar
pub fn connect_scopes(provider: SyncProvider) -> &'static str {
    match provider {
        SyncProvider::Google => "https://www.googleapis.com/auth/calendar.readonly",
        SyncProvider::Outlook => "offline_access Calendars.Read",
    }
}

/// Extra authorize parameters; Google only issues a refresh token for offline consent
pub fn connect_params(provider: SyncProvider) -> &'static [(&'static str, &'static str)] {
    match provider {
        SyncProvider::Google => &[("access_type", "offline"), ("prompt", "consent")],
        SyncProvider::Outlook => &[],
    }
}

/// Outcome of syncing one connection
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub provider: String,
    pub fetched: usize,
    pub inserted: usize,
    pub pages: usize,
}

/// Outcome of one scheduler pass over all connections
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub accounts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub inserted: usize,
}

/// Sync engine
#[derive(Clone)]
pub struct SyncEngine {
    pool: PgPool,
    google: Arc<dyn CalendarProvider>,
    outlook: Arc<dyn CalendarProvider>,
}

impl SyncEngine {
    pub fn new(
        pool: PgPool,
        google: Arc<dyn CalendarProvider>,
        outlook: Arc<dyn CalendarProvider>,
    ) -> Self {
        Self {
            pool,
            google,
            outlook,
        }
    }

    /// Engine talking to the real provider APIs with the configured OAuth apps
    pub fn from_state(state: &AppState) -> Self {
        let config = &state.config;
        Self::new(
            state.pool.clone(),
            Arc::new(GoogleCalendarProvider::new(
                state.http.clone(),
                config.google.clone(),
            )),
            Arc::new(OutlookCalendarProvider::new(
                state.http.clone(),
                config.microsoft.clone(),
                &config.microsoft_tenant,
            )),
        )
    }

    fn provider(&self, provider: SyncProvider) -> &dyn CalendarProvider {
        match provider {
            SyncProvider::Google => self.google.as_ref(),
            SyncProvider::Outlook => self.outlook.as_ref(),
        }
    }

    /// Sync every enabled connection, one after another
    ///
    /// A failing connection is recorded in its `last_error` and does not stop
    /// the pass.
    pub async fn sync_all(&self) -> Result<SyncSummary> {
        let accounts = sqlx::query_as::<_, CalendarSync>(
            "SELECT * FROM calendar_syncs WHERE sync_enabled = TRUE ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SyncSummary {
            accounts: accounts.len(),
            ..Default::default()
        };

        for account in accounts {
            let (id, provider) = (account.id, account.provider.clone());
            match self.sync_account(account).await {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.inserted += report.inserted;
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!("Sync of {} connection {} failed: {}", provider, id, e);
                }
            }
        }

        tracing::info!(
            "Calendar sync pass: {} accounts, {} ok, {} failed, {} new events",
            summary.accounts,
            summary.succeeded,
            summary.failed,
            summary.inserted
        );
        Ok(summary)
    }

    /// Sync one connection and record the outcome on its row
    pub async fn sync_account(&self, account: CalendarSync) -> Result<SyncReport> {
        let id = account.id;
        match self.run(account).await {
            Ok(report) => {
                sqlx::query(
                    r#"
                    UPDATE calendar_syncs
                    SET last_sync = NOW(), last_error = NULL, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(report)
            }
            Err(e) => {
                let recorded = sqlx::query(
                    "UPDATE calendar_syncs SET last_error = $1, updated_at = NOW() WHERE id = $2",
                )
                .bind(e.to_string())
                .bind(id)
                .execute(&self.pool)
                .await;
                if let Err(db_err) = recorded {
                    tracing::warn!("Could not record sync error for {}: {}", id, db_err);
                }
                Err(e)
            }
        }
    }

    async fn run(&self, account: CalendarSync) -> Result<SyncReport> {
        let kind: SyncProvider = account.provider.parse().map_err(AppError::InvalidInput)?;
        let provider = self.provider(kind);

        let access_token = self.fresh_access_token(provider, &account).await?;

        let now = Utc::now();
        let window = FetchWindow {
            time_min: now,
            time_max: now + Duration::days(SYNC_WINDOW_DAYS),
        };

        let mut fetched = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = provider
                .fetch_events(&access_token, &account.calendar_id, window, cursor.as_deref())
                .await?;
            pages += 1;
            fetched.extend(page.events);
            cursor = page.next_page;

            if cursor.is_none() {
                break;
            }
            if pages >= MAX_SYNC_PAGES {
                tracing::warn!(
                    "Stopping {} sync for user {} after {} pages",
                    kind,
                    account.user_id,
                    pages
                );
                break;
            }
        }

        let inserted = store_events(&self.pool, account.user_id, kind.event_source(), &fetched).await?;

        tracing::info!(
            "Synced {} for user {}: {} fetched, {} new",
            kind,
            account.user_id,
            fetched.len(),
            inserted
        );

        Ok(SyncReport {
            provider: kind.to_string(),
            fetched: fetched.len(),
            inserted,
            pages,
        })
    }

    /// Current access token, refreshed first when it is about to expire
    async fn fresh_access_token(
        &self,
        provider: &dyn CalendarProvider,
        account: &CalendarSync,
    ) -> Result<String> {
        let now = Utc::now();
        if !account.token_needs_refresh(now, TOKEN_REFRESH_MARGIN_SECS) {
            return Ok(account.access_token.clone());
        }

        let Some(refresh_token) = account.refresh_token.as_deref() else {
            tracing::warn!(
                "{} token for user {} is expiring and has no refresh token",
                account.provider,
                account.user_id
            );
            return Ok(account.access_token.clone());
        };

        let tokens = provider.refresh_token(refresh_token).await?;

        sqlx::query(
            r#"
            UPDATE calendar_syncs
            SET access_token = $1,
                refresh_token = COALESCE($2, refresh_token),
                token_expires_at = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at(now))
        .bind(account.id)
        .execute(&self.pool)
        .await?;

        Ok(tokens.access_token)
    }
}

/// Store fetched events for a user, skipping ones already present
///
/// Returns how many rows were inserted. Attendees are written only with a
/// newly inserted event.
pub async fn store_events(
    pool: &PgPool,
    user_id: Uuid,
    source: EventSource,
    events: &[FetchedEvent],
) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let mut inserted = 0;

    for event in events {
        let event_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO events
                (id, user_id, title, description, location, start_time, end_time, all_day, source, external_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (external_id, user_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(&event.location)
        .bind(event.start_time)
        .bind(event.end_time)
        .bind(event.all_day)
        .bind(source.as_str())
        .bind(&event.external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(event_id) = event_id else {
            continue;
        };
        inserted += 1;

        for attendee in &event.attendees {
            sqlx::query(
                r#"
                INSERT INTO event_attendees (id, event_id, email, name, status)
                VALUES ($1, $2, $3, $4, COALESCE($5, 'needsAction'))
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(event_id)
            .bind(&attendee.email)
            .bind(&attendee.name)
            .bind(&attendee.status)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_provider_mapping() {
        assert_eq!(oauth_provider(SyncProvider::Google), OAuthProvider::Google);
        assert_eq!(oauth_provider(SyncProvider::Outlook), OAuthProvider::Microsoft);
    }

    #[test]
    fn test_connect_scopes_are_read_only() {
        assert!(connect_scopes(SyncProvider::Google).ends_with("calendar.readonly"));
        assert!(connect_scopes(SyncProvider::Outlook).contains("Calendars.Read"));
        assert!(connect_scopes(SyncProvider::Outlook).contains("offline_access"));
    }
}
