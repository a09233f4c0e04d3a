/// Calendar provider adapters
///
/// One adapter per provider behind the [`CalendarProvider`] capability
/// trait. Adapters own token refresh, pagination and incremental-sync
/// quirks; everything above this module only sees [`RawEvent`]s, opaque
/// [`SyncCursor`]s and classified errors.

pub mod caldav;
pub mod credentials;
pub mod google;
pub mod http;
pub mod microsoft;

pub use self::credentials::CredentialManager;

use crate::config::{ServerConfig, SyncConfig};
use crate::db::models::{Calendar, ConnectedAccount, ProviderKind, PushSubscription};
use crate::error::{CalError, CalResult, ProviderError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use validator::Validate;

/// Provider-owned incremental sync checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncCursor {
    Google { token: String },
    Microsoft { link: String },
    #[serde(rename = "caldav")]
    CalDav { etags: BTreeMap<String, String> },
}

/// Provider event before normalization
#[derive(Debug, Clone)]
pub enum RawEvent {
    Google(google::GoogleEvent),
    Microsoft(microsoft::GraphEvent),
    /// One calendar object resource from a CalDAV collection
    Ics {
        href: String,
        etag: Option<String>,
        body: String,
    },
    /// Provider reports the item as deleted
    Removed { provider_event_id: String },
}

impl RawEvent {
    pub fn provider_event_id(&self) -> &str {
        match self {
            RawEvent::Google(event) => &event.id,
            RawEvent::Microsoft(event) => &event.id,
            RawEvent::Ics { href, .. } => href,
            RawEvent::Removed { provider_event_id } => provider_event_id,
        }
    }
}

/// Bounded past-to-future window used for full fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn around(now: DateTime<Utc>, config: &SyncConfig) -> Self {
        Self {
            start: now - Duration::days(config.window_past_days),
            end: now + Duration::days(config.window_future_days),
        }
    }
}

/// Result of one `list_events` call
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    pub next_cursor: Option<SyncCursor>,
    /// Set when this was a full fetch: the events are the complete contents of the window
    pub snapshot: Option<FetchWindow>,
}

/// Calendar as reported by the provider
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCalendar {
    pub provider_calendar_id: String,
    pub name: String,
    pub color: Option<String>,
    pub timezone: Option<String>,
    pub is_primary: bool,
}

/// Single event to create on a provider calendar
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EventDraft {
    #[validate(length(min = 1, max = 1024))]
    pub title: String,
    #[validate(length(max = 8192))]
    pub description: Option<String>,
    #[validate(length(max = 1024))]
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub is_all_day: bool,
    /// IANA zone the event should be displayed in
    pub timezone: Option<String>,
    #[serde(default)]
    #[validate(length(max = 100))]
    pub attendees: Vec<String>,
}

impl EventDraft {
    pub fn check(&self) -> CalResult<()> {
        self.validate()?;
        if self.ends_at <= self.starts_at {
            return Err(CalError::Validation(
                "Event must end after it starts".to_string(),
            ));
        }
        if let Some(tz) = &self.timezone {
            tz.parse::<chrono_tz::Tz>()
                .map_err(|_| CalError::Validation(format!("Unknown timezone: {}", tz)))?;
        }
        Ok(())
    }

    pub fn timezone_name(&self) -> &str {
        self.timezone.as_deref().unwrap_or("UTC")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedEvent {
    pub external_id: String,
    pub link: Option<String>,
}

/// Push channel or subscription as registered with the provider
#[derive(Debug, Clone, PartialEq)]
pub struct PushHandle {
    pub channel_id: String,
    pub resource_id: Option<String>,
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
}

/// Tokens returned by an OAuth code exchange or refresh
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
}

/// External identity behind an OAuth grant
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub provider_account_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// OAuth token endpoint and profile lookup for one provider
#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> CalResult<TokenGrant>;

    /// Denied refreshes surface as [`CalError::ReauthorizationRequired`].
    async fn refresh(&self, refresh_token: &str) -> CalResult<TokenGrant>;

    async fn fetch_profile(&self, access_token: &str) -> CalResult<ProviderProfile>;
}

/// Capability set every provider adapter implements
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn list_calendars(&self, account: &ConnectedAccount) -> CalResult<Vec<RemoteCalendar>>;

    /// Full window fetch without a cursor, incremental fetch with one.
    async fn list_events(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        cursor: Option<&SyncCursor>,
    ) -> CalResult<EventPage>;

    async fn create_event(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        draft: &EventDraft,
    ) -> CalResult<CreatedEvent>;

    async fn register_push(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
    ) -> CalResult<PushHandle>;

    async fn renew_push(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        subscription: &PushSubscription,
    ) -> CalResult<PushHandle>;

    async fn stop_push(
        &self,
        account: &ConnectedAccount,
        subscription: &PushSubscription,
    ) -> CalResult<()>;
}

/// Adapter lookup by provider kind
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CalendarProvider>>,
    oauth: HashMap<ProviderKind, Arc<dyn OAuthClient>>,
    caldav: Option<Arc<caldav::CalDavProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the Google, Microsoft and CalDAV adapters
    pub fn from_config(config: &ServerConfig, credentials: CredentialManager) -> CalResult<Self> {
        let client = http::build_client()?;

        let google_oauth = Arc::new(google::GoogleOAuth::new(client.clone(), config.google.clone()));
        let microsoft_oauth = Arc::new(microsoft::MicrosoftOAuth::new(
            client.clone(),
            config.microsoft.clone(),
        ));

        let mut registry = Self::new();
        registry.register(Arc::new(google::GoogleProvider::new(
            client.clone(),
            config,
            credentials.clone(),
            google_oauth.clone(),
        )));
        registry.register(Arc::new(microsoft::MicrosoftProvider::new(
            client.clone(),
            config,
            credentials.clone(),
            microsoft_oauth.clone(),
        )));
        registry.register_caldav(Arc::new(caldav::CalDavProvider::new(
            client,
            config.sync.clone(),
            credentials,
        )));
        registry.register_oauth(ProviderKind::Google, google_oauth);
        registry.register_oauth(ProviderKind::Microsoft, microsoft_oauth);

        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn CalendarProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn register_oauth(&mut self, kind: ProviderKind, client: Arc<dyn OAuthClient>) {
        self.oauth.insert(kind, client);
    }

    /// CalDAV also serves login verification, which needs the concrete adapter
    pub fn register_caldav(&mut self, provider: Arc<caldav::CalDavProvider>) {
        self.register(provider.clone());
        self.caldav = Some(provider);
    }

    pub fn get(&self, kind: ProviderKind) -> CalResult<Arc<dyn CalendarProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| CalError::Internal(format!("No adapter registered for {}", kind)))
    }

    pub fn caldav(&self) -> CalResult<Arc<caldav::CalDavProvider>> {
        self.caldav
            .clone()
            .ok_or_else(|| CalError::Internal("CalDAV adapter is not registered".to_string()))
    }

    pub fn oauth(&self, kind: ProviderKind) -> CalResult<Arc<dyn OAuthClient>> {
        self.oauth.get(&kind).cloned().ok_or_else(|| {
            CalError::Validation(format!("{} does not use OAuth connections", kind))
        })
    }
}

/// Shorthand for adapters rejecting an operation
pub(crate) fn unsupported<T>(operation: &'static str) -> CalResult<T> {
    Err(CalError::Provider(ProviderError::Unsupported(operation)))
}
