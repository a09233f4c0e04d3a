/// Shared fixtures for unit tests
use crate::db::models::{
    Calendar, ConnectedAccount, EventStatus, NormalizedEvent, ProviderKind, PushSubscription,
    SyncStatus, Visibility,
};
use crate::error::{CalError, CalResult};
use crate::jobs::{Task, TaskDispatcher};
use crate::providers::{
    CalendarProvider, CreatedEvent, EventDraft, EventPage, OAuthClient, ProviderProfile,
    PushHandle, RemoteCalendar, SyncCursor, TokenGrant,
};
use crate::store::{SqliteStore, Store};
use crate::vault::CredentialVault;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const TEST_MASTER_SECRET: &str = "test-master-secret-that-is-long-enough";

pub fn test_vault() -> Arc<CredentialVault> {
    Arc::new(CredentialVault::new(TEST_MASTER_SECRET))
}

pub async fn test_store() -> SqliteStore {
    SqliteStore::new(crate::db::test_pool().await)
}

/// Google account with a fresh token and a single `primary` calendar.
pub async fn seed_account(store: &SqliteStore, user_id: &str) -> (ConnectedAccount, Calendar) {
    seed_account_for(store, user_id, ProviderKind::Google).await
}

pub async fn seed_account_for(
    store: &SqliteStore,
    user_id: &str,
    provider: ProviderKind,
) -> (ConnectedAccount, Calendar) {
    let account = ConnectedAccount {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        provider,
        provider_account_id: format!("{}-{}", provider, user_id),
        email: Some(format!("{}@example.com", user_id)),
        display_name: Some(user_id.to_string()),
        scopes: "calendar".to_string(),
        is_active: true,
        sync_status: SyncStatus::Pending,
        error_message: None,
        reconnect_required: false,
        last_synced_at: None,
        created_at: Utc::now(),
    };

    let vault = test_vault();
    let credential = crate::db::models::Credential {
        account_id: account.id.clone(),
        access: vault.encrypt("access-token", user_id).unwrap(),
        refresh: Some(vault.encrypt("refresh-token", user_id).unwrap()),
        token_type: "Bearer".to_string(),
        expires_at: Some(Utc::now() + Duration::hours(1)),
        refresh_expires_at: None,
        updated_at: Utc::now(),
    };
    let account = store.connect_account(&account, &credential).await.unwrap();

    let calendar = store
        .upsert_calendar(
            &account.id,
            &RemoteCalendar {
                provider_calendar_id: "primary".to_string(),
                name: "Primary".to_string(),
                color: None,
                timezone: Some("UTC".to_string()),
                is_primary: true,
            },
        )
        .await
        .unwrap();

    (account, calendar)
}

pub fn normalized_event(id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> NormalizedEvent {
    NormalizedEvent {
        provider_event_id: id.to_string(),
        provider_ical_uid: None,
        title: id.to_string(),
        description: None,
        location: None,
        url: None,
        starts_at: start,
        ends_at: end,
        is_all_day: false,
        timezone: "UTC".to_string(),
        is_recurring: false,
        recurrence_rule: None,
        recurring_event_id: None,
        original_start_time: None,
        status: EventStatus::Confirmed,
        visibility: Visibility::Default,
        organizer: None,
        attendees: vec![],
        attendee_count: 0,
        provider_etag: Some(format!("etag-{}", id)),
        provider_raw: None,
    }
}

/// OAuth client with a fixed refresh outcome
pub struct ScriptedOAuth {
    pub refresh_calls: AtomicUsize,
    revoked: bool,
}

impl ScriptedOAuth {
    pub fn succeeding() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            revoked: false,
        }
    }

    pub fn revoked() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            revoked: true,
        }
    }

    fn grant(&self) -> TokenGrant {
        TokenGrant {
            access_token: "new-access".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            refresh_expires_at: None,
            scopes: None,
        }
    }
}

#[async_trait]
impl OAuthClient for ScriptedOAuth {
    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> CalResult<TokenGrant> {
        if code == "bad-code" {
            return Err(CalError::ReauthorizationRequired("invalid_grant".to_string()));
        }
        if code == "no-refresh" {
            return Ok(self.grant());
        }
        Ok(TokenGrant {
            refresh_token: Some("refresh-token".to_string()),
            ..self.grant()
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> CalResult<TokenGrant> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.revoked {
            return Err(CalError::ReauthorizationRequired("invalid_grant".to_string()));
        }
        Ok(self.grant())
    }

    async fn fetch_profile(&self, _access_token: &str) -> CalResult<ProviderProfile> {
        Ok(ProviderProfile {
            provider_account_id: "external-1".to_string(),
            email: Some("someone@example.com".to_string()),
            display_name: Some("Someone".to_string()),
        })
    }
}

/// Adapter replaying scripted calendar lists and event pages
pub struct FakeProvider {
    kind: ProviderKind,
    pub calendars: Mutex<Vec<RemoteCalendar>>,
    pages: Mutex<VecDeque<CalResult<EventPage>>>,
    pub cursors_seen: Mutex<Vec<Option<SyncCursor>>>,
    pub list_event_calls: AtomicUsize,
    pub push_registrations: AtomicUsize,
    pub push_stops: AtomicUsize,
    pub delay: Mutex<Option<std::time::Duration>>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            calendars: Mutex::new(vec![RemoteCalendar {
                provider_calendar_id: "primary".to_string(),
                name: "Primary".to_string(),
                color: None,
                timezone: Some("UTC".to_string()),
                is_primary: true,
            }]),
            pages: Mutex::new(VecDeque::new()),
            cursors_seen: Mutex::new(Vec::new()),
            list_event_calls: AtomicUsize::new(0),
            push_registrations: AtomicUsize::new(0),
            push_stops: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    pub fn push_page(&self, page: CalResult<EventPage>) {
        self.pages.lock().unwrap().push_back(page);
    }

    pub fn set_calendars(&self, calendars: Vec<RemoteCalendar>) {
        *self.calendars.lock().unwrap() = calendars;
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl CalendarProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn list_calendars(&self, _account: &ConnectedAccount) -> CalResult<Vec<RemoteCalendar>> {
        Ok(self.calendars.lock().unwrap().clone())
    }

    async fn list_events(
        &self,
        _account: &ConnectedAccount,
        _calendar: &Calendar,
        cursor: Option<&SyncCursor>,
    ) -> CalResult<EventPage> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.list_event_calls.fetch_add(1, Ordering::SeqCst);
        self.cursors_seen.lock().unwrap().push(cursor.cloned());

        let next = self.pages.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(EventPage {
                events: vec![],
                next_cursor: cursor.cloned(),
                snapshot: None,
            })
        })
    }

    async fn create_event(
        &self,
        _account: &ConnectedAccount,
        _calendar: &Calendar,
        draft: &EventDraft,
    ) -> CalResult<CreatedEvent> {
        Ok(CreatedEvent {
            external_id: format!("created-{}", draft.title),
            link: None,
        })
    }

    async fn register_push(
        &self,
        _account: &ConnectedAccount,
        calendar: &Calendar,
    ) -> CalResult<PushHandle> {
        let n = self.push_registrations.fetch_add(1, Ordering::SeqCst);
        Ok(PushHandle {
            channel_id: format!("channel-{}-{}", calendar.provider_calendar_id, n),
            resource_id: Some("resource".to_string()),
            client_state: "secret-state".to_string(),
            expires_at: Utc::now() + Duration::days(3),
        })
    }

    async fn renew_push(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        _subscription: &PushSubscription,
    ) -> CalResult<PushHandle> {
        self.register_push(account, calendar).await
    }

    async fn stop_push(
        &self,
        _account: &ConnectedAccount,
        _subscription: &PushSubscription,
    ) -> CalResult<()> {
        self.push_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Dispatcher that only records what it was asked to run
#[derive(Default)]
pub struct RecordingDispatcher {
    pub tasks: Mutex<Vec<Task>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, task: Task) -> CalResult<()> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}
