/// Microsoft Graph calendar adapter
///
/// Incremental sync follows `calendarView/delta`: pages chain through
/// `@odata.nextLink` and the last one hands out an `@odata.deltaLink`, which
/// is the cursor. Subscriptions are extended in place with a PATCH.
use super::http::{check, read_json, read_token_json, send};
use super::{
    CalendarProvider, CreatedEvent, CredentialManager, EventDraft, EventPage, FetchWindow,
    OAuthClient, ProviderProfile, PushHandle, RawEvent, RemoteCalendar, SyncCursor, TokenGrant,
};
use crate::config::{OAuthProviderConfig, ServerConfig, SyncConfig};
use crate::db::models::{Calendar, ConnectedAccount, ProviderKind, PushSubscription};
use crate::error::{CalError, CalResult, ProviderError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCOPES: &str = "offline_access User.Read Calendars.ReadWrite";
/// Microsoft refresh tokens slide forward this far on every use
const REFRESH_WINDOW_DAYS: i64 = 90;

/// Event resource as returned by Graph, including delta tombstones
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEvent {
    pub id: String,
    #[serde(rename = "@removed")]
    pub removed: Option<serde_json::Value>,
    pub subject: Option<String>,
    pub body: Option<GraphBody>,
    pub body_preview: Option<String>,
    pub location: Option<GraphLocation>,
    pub start: Option<GraphDateTime>,
    pub end: Option<GraphDateTime>,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default)]
    pub is_cancelled: bool,
    pub show_as: Option<String>,
    pub sensitivity: Option<String>,
    pub series_master_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub recurrence: Option<serde_json::Value>,
    pub organizer: Option<GraphRecipient>,
    #[serde(default)]
    pub attendees: Vec<GraphAttendee>,
    pub response_status: Option<GraphResponse>,
    pub change_key: Option<String>,
    #[serde(rename = "iCalUId")]
    pub ical_uid: Option<String>,
    pub web_link: Option<String>,
    pub original_start_time_zone: Option<String>,
    pub original_start: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphBody {
    pub content_type: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphLocation {
    pub display_name: Option<String>,
}

/// Wall-clock time plus a Windows or IANA zone name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDateTime {
    pub date_time: String,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRecipient {
    pub email_address: Option<GraphEmail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEmail {
    pub address: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphAttendee {
    pub email_address: Option<GraphEmail>,
    pub status: Option<GraphResponse>,
    #[serde(rename = "type")]
    pub attendee_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphResponse {
    pub response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaResponse {
    #[serde(default)]
    value: Vec<GraphEvent>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CalendarsResponse {
    #[serde(default)]
    value: Vec<GraphCalendar>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphCalendar {
    id: String,
    name: Option<String>,
    hex_color: Option<String>,
    #[serde(default)]
    is_default_calendar: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionResponse {
    id: String,
    expiration_date_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedGraphEvent {
    id: String,
    web_link: Option<String>,
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
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: String,
    mail: Option<String>,
    user_principal_name: Option<String>,
    display_name: Option<String>,
}

/// Microsoft identity platform token endpoint and `/me`
pub struct MicrosoftOAuth {
    http: Client,
    config: OAuthProviderConfig,
}

impl MicrosoftOAuth {
    pub fn new(http: Client, config: OAuthProviderConfig) -> Self {
        Self { http, config }
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> CalResult<TokenGrant> {
        let response = send(self.http.post(&self.config.token_url).form(form)).await?;
        let token: TokenResponse = read_token_json(response).await?;
        let now = Utc::now();

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_type: token.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: now + Duration::seconds(token.expires_in),
            refresh_expires_at: Some(now + Duration::days(REFRESH_WINDOW_DAYS)),
            scopes: token.scope,
        })
    }
}

#[async_trait]
impl OAuthClient for MicrosoftOAuth {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> CalResult<TokenGrant> {
        self.token_request(&[
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
            ("scope", SCOPES),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> CalResult<TokenGrant> {
        self.token_request(&[
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
            ("scope", SCOPES),
        ])
        .await
    }

    async fn fetch_profile(&self, access_token: &str) -> CalResult<ProviderProfile> {
        let response = send(
            self.http
                .get(&self.config.profile_url)
                .bearer_auth(access_token),
        )
        .await?;
        let user: GraphUser = read_json(response).await?;

        Ok(ProviderProfile {
            provider_account_id: user.id,
            email: user.mail.or(user.user_principal_name),
            display_name: user.display_name,
        })
    }
}

/// Microsoft Graph v1.0 adapter
pub struct MicrosoftProvider {
    http: Client,
    api_base: String,
    webhook_url: String,
    subscription_lifetime: Duration,
    sync: SyncConfig,
    credentials: CredentialManager,
    oauth: Arc<MicrosoftOAuth>,
}

impl MicrosoftProvider {
    pub fn new(
        http: Client,
        config: &ServerConfig,
        credentials: CredentialManager,
        oauth: Arc<MicrosoftOAuth>,
    ) -> Self {
        Self {
            http,
            api_base: config.microsoft.api_base_url.trim_end_matches('/').to_string(),
            webhook_url: format!(
                "{}/webhooks/microsoft",
                config.service.public_url.trim_end_matches('/')
            ),
            subscription_lifetime: Duration::minutes(config.webhooks.microsoft_subscription_minutes),
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

    fn calendar_url(&self, calendar: &Calendar) -> String {
        format!(
            "{}/me/calendars/{}",
            self.api_base,
            urlencoding::encode(&calendar.provider_calendar_id)
        )
    }

    /// Walk `nextLink`s starting at `url` until a `deltaLink` shows up.
    async fn follow_delta(&self, token: &str, url: String) -> CalResult<(Vec<RawEvent>, Option<String>)> {
        let mut events = Vec::new();
        let mut next = url;

        loop {
            let response = send(
                self.http
                    .get(&next)
                    .bearer_auth(token)
                    .header("Prefer", "odata.maxpagesize=100, outlook.timezone=\"UTC\""),
            )
            .await?;
            let page: DeltaResponse = read_json(response).await?;

            events.extend(page.value.into_iter().map(|event| {
                if event.removed.is_some() || event.is_cancelled {
                    RawEvent::Removed {
                        provider_event_id: event.id,
                    }
                } else {
                    RawEvent::Microsoft(event)
                }
            }));

            match (page.next_link, page.delta_link) {
                (Some(link), _) => next = link,
                (None, delta) => return Ok((events, delta)),
            }
        }
    }

    async fn full_fetch(&self, token: &str, calendar: &Calendar) -> CalResult<EventPage> {
        let window = FetchWindow::around(Utc::now(), &self.sync);
        let url = format!(
            "{}/calendarView/delta?startDateTime={}&endDateTime={}",
            self.calendar_url(calendar),
            urlencoding::encode(&window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            urlencoding::encode(&window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );

        let (events, delta) = self.follow_delta(token, url).await?;
        debug!(calendar_id = %calendar.id, count = events.len(), "graph full fetch");

        Ok(EventPage {
            events,
            next_cursor: delta.map(|link| SyncCursor::Microsoft { link }),
            snapshot: Some(window),
        })
    }

    async fn subscribe(&self, token: &str, calendar: &Calendar) -> CalResult<PushHandle> {
        let client_state = Uuid::new_v4().simple().to_string();
        let expires_at = Utc::now() + self.subscription_lifetime;

        let response = send(
            self.http
                .post(format!("{}/subscriptions", self.api_base))
                .bearer_auth(token)
                .json(&json!({
                    "changeType": "created,updated,deleted",
                    "notificationUrl": self.webhook_url,
                    "resource": format!("me/calendars/{}/events", calendar.provider_calendar_id),
                    "expirationDateTime": expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "clientState": client_state,
                })),
        )
        .await?;
        let created: SubscriptionResponse = read_json(response).await?;

        Ok(PushHandle {
            channel_id: created.id,
            resource_id: None,
            client_state,
            expires_at: created.expiration_date_time,
        })
    }
}

fn graph_time(instant: DateTime<Utc>, draft: &EventDraft) -> CalResult<serde_json::Value> {
    let tz: chrono_tz::Tz = draft
        .timezone_name()
        .parse()
        .map_err(|_| CalError::Validation(format!("Unknown timezone: {}", draft.timezone_name())))?;
    let local = instant.with_timezone(&tz).naive_local();

    Ok(json!({
        "dateTime": local.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "timeZone": draft.timezone_name(),
    }))
}

#[async_trait]
impl CalendarProvider for MicrosoftProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Microsoft
    }

    async fn list_calendars(&self, account: &ConnectedAccount) -> CalResult<Vec<RemoteCalendar>> {
        let token = self.token(account).await?;
        let mut calendars = Vec::new();
        let mut next = Some(format!("{}/me/calendars", self.api_base));

        while let Some(url) = next {
            let response = send(self.http.get(&url).bearer_auth(&token)).await?;
            let page: CalendarsResponse = read_json(response).await?;

            calendars.extend(page.value.into_iter().map(|calendar| RemoteCalendar {
                name: calendar.name.unwrap_or_else(|| calendar.id.clone()),
                provider_calendar_id: calendar.id,
                color: calendar.hex_color.filter(|c| !c.is_empty()),
                timezone: None,
                is_primary: calendar.is_default_calendar,
            }));
            next = page.next_link;
        }

        Ok(calendars)
    }

    async fn list_events(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        cursor: Option<&SyncCursor>,
    ) -> CalResult<EventPage> {
        let token = self.token(account).await?;

        match cursor {
            // Never send the bearer token to a host we did not issue the link for
            Some(SyncCursor::Microsoft { link }) if link.starts_with(&self.api_base) => {
                match self.follow_delta(&token, link.clone()).await {
                    Ok((events, delta)) => {
                        return Ok(EventPage {
                            events,
                            next_cursor: delta
                                .map(|link| SyncCursor::Microsoft { link })
                                .or_else(|| cursor.cloned()),
                            snapshot: None,
                        })
                    }
                    Err(CalError::Provider(ProviderError::CursorInvalidated)) => {
                        warn!(calendar_id = %calendar.id, "graph delta link expired, refetching window");
                    }
                    Err(err) => return Err(err),
                }
            }
            Some(other) => {
                warn!(calendar_id = %calendar.id, ?other, "unusable cursor on graph calendar, ignoring");
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
            .map(|email| json!({ "emailAddress": { "address": email }, "type": "required" }))
            .collect();

        let body = json!({
            "subject": draft.title,
            "body": { "contentType": "text", "content": draft.description.clone().unwrap_or_default() },
            "location": { "displayName": draft.location.clone().unwrap_or_default() },
            "start": graph_time(draft.starts_at, draft)?,
            "end": graph_time(draft.ends_at, draft)?,
            "isAllDay": draft.is_all_day,
            "attendees": attendees,
        });

        let response = send(
            self.http
                .post(format!("{}/events", self.calendar_url(calendar)))
                .bearer_auth(&token)
                .json(&body),
        )
        .await?;
        let created: CreatedGraphEvent = read_json(response).await?;

        Ok(CreatedEvent {
            external_id: created.id,
            link: created.web_link,
        })
    }

    async fn register_push(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
    ) -> CalResult<PushHandle> {
        let token = self.token(account).await?;
        self.subscribe(&token, calendar).await
    }

    async fn renew_push(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        subscription: &PushSubscription,
    ) -> CalResult<PushHandle> {
        let token = self.token(account).await?;
        let expires_at = Utc::now() + self.subscription_lifetime;

        let response = send(
            self.http
                .patch(format!("{}/subscriptions/{}", self.api_base, subscription.channel_id))
                .bearer_auth(&token)
                .json(&json!({
                    "expirationDateTime": expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                })),
        )
        .await?;

        match read_json::<SubscriptionResponse>(response).await {
            Ok(renewed) => Ok(PushHandle {
                channel_id: renewed.id,
                resource_id: subscription.resource_id.clone(),
                client_state: subscription.client_state.clone(),
                expires_at: renewed.expiration_date_time,
            }),
            Err(CalError::Provider(ProviderError::Rejected { status: 404, .. })) => {
                info!(subscription_id = %subscription.channel_id, "graph subscription gone, creating a new one");
                self.subscribe(&token, calendar).await
            }
            Err(err) => Err(err),
        }
    }

    async fn stop_push(
        &self,
        account: &ConnectedAccount,
        subscription: &PushSubscription,
    ) -> CalResult<()> {
        let token = self.token(account).await?;
        let response = send(
            self.http
                .delete(format!("{}/subscriptions/{}", self.api_base, subscription.channel_id))
                .bearer_auth(&token),
        )
        .await?;

        match check(response).await {
            Ok(_) | Err(ProviderError::Rejected { status: 404, .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
