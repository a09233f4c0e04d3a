/// Google Calendar adapter
///
/// Incremental sync uses `syncToken`; an expired token (410) falls back to a
/// windowed full fetch with `timeMin`/`timeMax` and the token is replaced.
/// Push uses `events.watch` channels, which cannot be extended, so renewal
/// stops the old channel and opens a new one.
use super::http::{check, read_json, read_token_json, send};
use super::{
    CalendarProvider, CreatedEvent, CredentialManager, EventDraft, EventPage, FetchWindow,
    OAuthClient, ProviderProfile, PushHandle, RawEvent, RemoteCalendar, SyncCursor, TokenGrant,
};
use crate::config::{OAuthProviderConfig, ServerConfig, SyncConfig};
use crate::db::models::{Calendar, ConnectedAccount, ProviderKind, PushSubscription};
use crate::error::{CalError, CalResult, ProviderError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const PAGE_SIZE: &str = "250";

/// Event resource as returned by the Calendar API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEvent {
    pub id: String,
    pub status: Option<String>,
    pub html_link: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<GoogleDateTime>,
    pub end: Option<GoogleDateTime>,
    #[serde(default)]
    pub recurrence: Vec<String>,
    pub recurring_event_id: Option<String>,
    pub original_start_time: Option<GoogleDateTime>,
    pub visibility: Option<String>,
    pub transparency: Option<String>,
    pub organizer: Option<GooglePerson>,
    #[serde(default)]
    pub attendees: Vec<GoogleAttendee>,
    pub etag: Option<String>,
    #[serde(rename = "iCalUID")]
    pub ical_uid: Option<String>,
    pub hangout_link: Option<String>,
}

/// `date` for all-day events, `dateTime` (RFC 3339) otherwise
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleDateTime {
    pub date: Option<String>,
    pub date_time: Option<String>,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GooglePerson {
    pub email: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleAttendee {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub response_status: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub resource: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListResponse {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListEntry {
    id: String,
    summary: Option<String>,
    summary_override: Option<String>,
    background_color: Option<String>,
    time_zone: Option<String>,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertedEvent {
    id: String,
    html_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResponse {
    id: String,
    resource_id: Option<String>,
    /// Milliseconds since the epoch, as a string
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
    scope: Option<String>,
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    email: Option<String>,
    name: Option<String>,
}

/// Google OAuth token endpoint and OpenID userinfo
pub struct GoogleOAuth {
    http: Client,
    config: OAuthProviderConfig,
}

impl GoogleOAuth {
    pub fn new(http: Client, config: OAuthProviderConfig) -> Self {
        Self { http, config }
    }

    fn grant_from(response: TokenResponse) -> TokenGrant {
        TokenGrant {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: Utc::now() + Duration::seconds(response.expires_in),
            refresh_expires_at: None,
            scopes: response.scope,
        }
    }
}

#[async_trait]
impl OAuthClient for GoogleOAuth {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> CalResult<TokenGrant> {
        let response = send(self.http.post(&self.config.token_url).form(&[
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ]))
        .await?;

        let token: TokenResponse = read_token_json(response).await?;
        Ok(Self::grant_from(token))
    }

    async fn refresh(&self, refresh_token: &str) -> CalResult<TokenGrant> {
        let response = send(self.http.post(&self.config.token_url).form(&[
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ]))
        .await?;

        let token: TokenResponse = read_token_json(response).await?;
        Ok(Self::grant_from(token))
    }

    async fn fetch_profile(&self, access_token: &str) -> CalResult<ProviderProfile> {
        let response = send(
            self.http
                .get(&self.config.profile_url)
                .bearer_auth(access_token),
        )
        .await?;

        let info: UserInfo = read_json(response).await?;
        Ok(ProviderProfile {
            provider_account_id: info.sub,
            email: info.email,
            display_name: info.name,
        })
    }
}

/// Google Calendar API v3 adapter
pub struct GoogleProvider {
    http: Client,
    api_base: String,
    webhook_url: String,
    channel_ttl: Duration,
    sync: SyncConfig,
    credentials: CredentialManager,
    oauth: Arc<GoogleOAuth>,
}

impl GoogleProvider {
    pub fn new(
        http: Client,
        config: &ServerConfig,
        credentials: CredentialManager,
        oauth: Arc<GoogleOAuth>,
    ) -> Self {
        Self {
            http,
            api_base: config.google.api_base_url.trim_end_matches('/').to_string(),
            webhook_url: format!(
                "{}/webhooks/google",
                config.service.public_url.trim_end_matches('/')
            ),
            channel_ttl: Duration::hours(config.webhooks.google_channel_ttl_hours),
            sync: config.sync.clone(),
            credentials,
            oauth,
        }
    }

    async fn token(&self, account: &ConnectedAccount) -> CalResult<String> {
        self.credentials
            .access_token(account, self.oauth.as_ref())
            .await
    }

    fn events_url(&self, calendar: &Calendar) -> String {
        format!(
            "{}/calendars/{}/events",
            self.api_base,
            urlencoding::encode(&calendar.provider_calendar_id)
        )
    }

    /// Follow `nextPageToken` until the final page hands out `nextSyncToken`.
    async fn fetch_pages(
        &self,
        token: &str,
        calendar: &Calendar,
        base_query: Vec<(&'static str, String)>,
    ) -> CalResult<(Vec<RawEvent>, Option<String>)> {
        let url = self.events_url(calendar);
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = base_query.clone();
            if let Some(page) = &page_token {
                query.push(("pageToken", page.clone()));
            }

            let response = send(self.http.get(&url).bearer_auth(token).query(&query)).await?;
            let page: EventsResponse = read_json(response).await?;

            events.extend(page.items.into_iter().map(|event| {
                if event.status.as_deref() == Some("cancelled") {
                    RawEvent::Removed {
                        provider_event_id: event.id,
                    }
                } else {
                    RawEvent::Google(event)
                }
            }));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok((events, page.next_sync_token)),
            }
        }
    }

    async fn full_fetch(&self, token: &str, calendar: &Calendar) -> CalResult<EventPage> {
        let window = FetchWindow::around(Utc::now(), &self.sync);
        let query = vec![
            ("timeMin", window.start.to_rfc3339()),
            ("timeMax", window.end.to_rfc3339()),
            ("singleEvents", "true".to_string()),
            ("maxResults", PAGE_SIZE.to_string()),
        ];

        let (events, sync_token) = self.fetch_pages(token, calendar, query).await?;
        debug!(calendar_id = %calendar.id, count = events.len(), "google full fetch");

        Ok(EventPage {
            events,
            next_cursor: sync_token.map(|token| SyncCursor::Google { token }),
            snapshot: Some(window),
        })
    }

    async fn watch(
        &self,
        token: &str,
        calendar: &Calendar,
    ) -> CalResult<PushHandle> {
        let channel_id = Uuid::new_v4().to_string();
        let client_state = Uuid::new_v4().simple().to_string();

        let response = send(
            self.http
                .post(format!("{}/watch", self.events_url(calendar)))
                .bearer_auth(token)
                .json(&json!({
                    "id": channel_id,
                    "type": "web_hook",
                    "address": self.webhook_url,
                    "token": client_state,
                    "params": { "ttl": self.channel_ttl.num_seconds().to_string() },
                })),
        )
        .await?;
        let channel: ChannelResponse = read_json(response).await?;

        let expires_at = channel
            .expiration
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| Utc::now() + self.channel_ttl);

        Ok(PushHandle {
            channel_id: channel.id,
            resource_id: channel.resource_id,
            client_state,
            expires_at,
        })
    }
}

fn google_time(instant: DateTime<Utc>, draft: &EventDraft) -> CalResult<serde_json::Value> {
    let tz: chrono_tz::Tz = draft
        .timezone_name()
        .parse()
        .map_err(|_| CalError::Validation(format!("Unknown timezone: {}", draft.timezone_name())))?;
    let local = instant.with_timezone(&tz);

    Ok(if draft.is_all_day {
        json!({ "date": local.date_naive().to_string() })
    } else {
        json!({ "dateTime": local.to_rfc3339(), "timeZone": draft.timezone_name() })
    })
}

#[async_trait]
impl CalendarProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn list_calendars(&self, account: &ConnectedAccount) -> CalResult<Vec<RemoteCalendar>> {
        let token = self.token(account).await?;
        let url = format!("{}/users/me/calendarList", self.api_base);
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.http.get(&url).bearer_auth(&token);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page)]);
            }
            let page: CalendarListResponse = read_json(send(request).await?).await?;

            calendars.extend(page.items.into_iter().filter(|entry| !entry.deleted).map(
                |entry| RemoteCalendar {
                    name: entry
                        .summary_override
                        .or(entry.summary)
                        .unwrap_or_else(|| entry.id.clone()),
                    provider_calendar_id: entry.id,
                    color: entry.background_color,
                    timezone: entry.time_zone,
                    is_primary: entry.primary,
                },
            ));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(calendars),
            }
        }
    }

    async fn list_events(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        cursor: Option<&SyncCursor>,
    ) -> CalResult<EventPage> {
        let token = self.token(account).await?;

        match cursor {
            Some(SyncCursor::Google { token: sync_token }) => {
                let query = vec![
                    ("syncToken", sync_token.clone()),
                    ("singleEvents", "true".to_string()),
                    ("maxResults", PAGE_SIZE.to_string()),
                ];
                match self.fetch_pages(&token, calendar, query).await {
                    Ok((events, next)) => {
                        return Ok(EventPage {
                            events,
                            next_cursor: next
                                .map(|token| SyncCursor::Google { token })
                                .or_else(|| cursor.cloned()),
                            snapshot: None,
                        })
                    }
                    Err(CalError::Provider(ProviderError::CursorInvalidated)) => {
                        warn!(calendar_id = %calendar.id, "google sync token expired, refetching window");
                    }
                    Err(err) => return Err(err),
                }
            }
            Some(other) => {
                warn!(calendar_id = %calendar.id, ?other, "foreign cursor on google calendar, ignoring");
            }
            None => {}
        }

        self.full_fetch(&token, calendar).await
    }

    async fn create_event(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        draft: &EventDraft,
    ) -> CalResult<CreatedEvent> {
        let token = self.token(account).await?;
        let attendees: Vec<_> = draft
            .attendees
            .iter()
            .map(|email| json!({ "email": email }))
            .collect();

        let body = json!({
            "summary": draft.title,
            "description": draft.description,
            "location": draft.location,
            "start": google_time(draft.starts_at, draft)?,
            "end": google_time(draft.ends_at, draft)?,
            "attendees": attendees,
        });

        let response = send(
            self.http
                .post(self.events_url(calendar))
                .bearer_auth(&token)
                .json(&body),
        )
        .await?;
        let created: InsertedEvent = read_json(response).await?;

        Ok(CreatedEvent {
            external_id: created.id,
            link: created.html_link,
        })
    }

    async fn register_push(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
    ) -> CalResult<PushHandle> {
        let token = self.token(account).await?;
        self.watch(&token, calendar).await
    }

    async fn renew_push(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        subscription: &PushSubscription,
    ) -> CalResult<PushHandle> {
        if let Err(err) = self.stop_push(account, subscription).await {
            warn!(channel_id = %subscription.channel_id, "failed to stop old google channel: {}", err);
        }
        let token = self.token(account).await?;
        self.watch(&token, calendar).await
    }

    async fn stop_push(
        &self,
        account: &ConnectedAccount,
        subscription: &PushSubscription,
    ) -> CalResult<()> {
        let token = self.token(account).await?;
        let response = send(
            self.http
                .post(format!("{}/channels/stop", self.api_base))
                .bearer_auth(&token)
                .json(&json!({
                    "id": subscription.channel_id,
                    "resourceId": subscription.resource_id,
                })),
        )
        .await?;

        match check(response).await {
            Ok(_) => Ok(()),
            // Already gone
            Err(ProviderError::Rejected { status: 404, .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
