/// Account manager
///
/// Everything a signed-in user does to their connected accounts goes
/// through here. Actual sync work is never done inline; it is queued on the
/// task dispatcher.
use super::{AccountView, ConnectCalDavRequest, ConnectOAuthRequest};
use crate::{
    cache::{self, keys, Cache},
    db::models::{Calendar, ConnectedAccount, Event, ProviderKind, SyncStatus},
    error::{CalError, CalResult},
    jobs::{Task, TaskDispatcher},
    providers::{
        caldav, credentials::BasicCredentials, CreatedEvent, CredentialManager, EventDraft,
        ProviderRegistry,
    },
    rate_limit::SyncRateLimiter,
    store::Store,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

const MAX_EVENT_RANGE_DAYS: i64 = 370;

/// Account manager service
pub struct AccountManager {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    registry: ProviderRegistry,
    credentials: CredentialManager,
    dispatcher: Arc<dyn TaskDispatcher>,
    limiter: SyncRateLimiter,
}

impl AccountManager {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        registry: ProviderRegistry,
        credentials: CredentialManager,
        dispatcher: Arc<dyn TaskDispatcher>,
        limiter: SyncRateLimiter,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            credentials,
            dispatcher,
            limiter,
        }
    }

    /// Finish an OAuth connection: exchange the code, look up the profile,
    /// store account and credential together, then queue account setup.
    pub async fn connect_oauth(
        &self,
        user_id: &str,
        request: &ConnectOAuthRequest,
    ) -> CalResult<ConnectedAccount> {
        request.validate()?;
        let oauth = self.registry.oauth(request.provider)?;

        let grant = oauth
            .exchange_code(&request.code, &request.redirect_uri)
            .await?;
        let profile = oauth.fetch_profile(&grant.access_token).await?;

        let account = ConnectedAccount {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            provider: request.provider,
            provider_account_id: profile.provider_account_id,
            email: profile.email,
            display_name: profile.display_name,
            scopes: grant.scopes.clone().unwrap_or_default(),
            is_active: true,
            sync_status: SyncStatus::Pending,
            error_message: None,
            reconnect_required: false,
            last_synced_at: None,
            created_at: Utc::now(),
        };

        // Providers may skip the refresh token on a repeat consent; keep the stored one
        let previous = match self.find_existing(&account).await? {
            Some(existing) => self.store.get_credential(&existing.id).await?,
            None => None,
        };
        let credential = self
            .credentials
            .seal_grant(&account, &grant, previous.as_ref())?;
        let stored = self.store.connect_account(&account, &credential).await?;

        info!(
            user_id,
            account_id = %stored.id,
            provider = %stored.provider,
            "account connected"
        );
        self.after_connect(&stored).await?;
        Ok(stored)
    }

    /// Connect a CalDAV server. The login is verified by listing calendars
    /// before anything is stored.
    pub async fn connect_caldav(
        &self,
        user_id: &str,
        request: &ConnectCalDavRequest,
    ) -> CalResult<ConnectedAccount> {
        request.validate()?;

        let login = BasicCredentials {
            server_url: request.server_url.clone(),
            username: request.username.clone(),
            password: request.password.clone(),
        };
        let provider_account_id = caldav::provider_account_id(&login)?;
        let calendars = self.registry.caldav()?.discover(&login).await?;

        let account = ConnectedAccount {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            provider: ProviderKind::CalDav,
            provider_account_id,
            email: Some(request.username.clone()),
            display_name: Some(request.username.clone()),
            scopes: String::new(),
            is_active: true,
            sync_status: SyncStatus::Pending,
            error_message: None,
            reconnect_required: false,
            last_synced_at: None,
            created_at: Utc::now(),
        };

        let credential =
            self.credentials
                .seal_basic(&account, &request.server_url, &request.password)?;
        let stored = self.store.connect_account(&account, &credential).await?;

        for calendar in &calendars {
            self.store.upsert_calendar(&stored.id, calendar).await?;
        }

        info!(
            user_id,
            account_id = %stored.id,
            calendars = calendars.len(),
            "caldav account connected"
        );
        self.after_connect(&stored).await?;
        Ok(stored)
    }

    /// Stored account for the same external identity, if any
    async fn find_existing(&self, account: &ConnectedAccount) -> CalResult<Option<ConnectedAccount>> {
        Ok(self
            .store
            .list_accounts_for_user(&account.user_id)
            .await?
            .into_iter()
            .find(|a| {
                a.provider == account.provider
                    && a.provider_account_id == account.provider_account_id
            }))
    }

    async fn after_connect(&self, account: &ConnectedAccount) -> CalResult<()> {
        cache::invalidate_user(self.cache.as_ref(), &account.user_id).await?;
        self.dispatcher
            .dispatch(Task::SetupAccount {
                account_id: account.id.clone(),
            })
            .await
    }

    pub async fn list_accounts(&self, user_id: &str) -> CalResult<Vec<AccountView>> {
        let mut views = Vec::new();
        for account in self.store.list_accounts_for_user(user_id).await? {
            let calendars = self.store.list_calendars(&account.id).await?;
            views.push(AccountView { account, calendars });
        }
        Ok(views)
    }

    /// Account owned by the user, or NotFound
    async fn owned_account(&self, user_id: &str, account_id: &str) -> CalResult<ConnectedAccount> {
        self.store
            .get_account(account_id)
            .await?
            .filter(|a| a.user_id == user_id)
            .ok_or_else(|| CalError::NotFound(format!("Account {} not found", account_id)))
    }

    /// Calendar whose account is owned by the user, plus that account
    async fn owned_calendar(
        &self,
        user_id: &str,
        calendar_id: &str,
    ) -> CalResult<(ConnectedAccount, Calendar)> {
        let not_found = || CalError::NotFound(format!("Calendar {} not found", calendar_id));

        let calendar = self
            .store
            .get_calendar(calendar_id)
            .await?
            .ok_or_else(not_found)?;
        let account = self
            .store
            .get_account(&calendar.account_id)
            .await?
            .filter(|a| a.user_id == user_id)
            .ok_or_else(not_found)?;

        Ok((account, calendar))
    }

    /// Stop push channels, drop the credential and deactivate the account.
    /// Events and calendar settings stay for history.
    pub async fn disconnect(&self, user_id: &str, account_id: &str) -> CalResult<()> {
        let account = self.owned_account(user_id, account_id).await?;

        if account.is_active {
            self.stop_push_channels(&account).await?;
        }

        self.store.deactivate_account(account_id).await?;
        cache::invalidate_user(self.cache.as_ref(), user_id).await?;

        // Its events no longer count towards conflicts
        self.dispatcher
            .dispatch(Task::ConflictRescan {
                user_id: user_id.to_string(),
            })
            .await?;

        info!(user_id, account_id, "account disconnected");
        Ok(())
    }

    async fn stop_push_channels(&self, account: &ConnectedAccount) -> CalResult<()> {
        let provider = self.registry.get(account.provider)?;
        for subscription in self.store.list_push_subscriptions(&account.id).await? {
            if let Err(e) = provider.stop_push(account, &subscription).await {
                // Channels expire on their own
                warn!(channel_id = %subscription.channel_id, "failed to stop push channel: {}", e);
            }
        }
        Ok(())
    }

    /// Remove every trace of a user.
    pub async fn delete_user_data(&self, user_id: &str) -> CalResult<()> {
        for account in self.store.list_accounts_for_user(user_id).await? {
            if account.is_active {
                self.stop_push_channels(&account).await?;
            }
        }

        self.store.delete_user_data(user_id).await?;
        cache::invalidate_user(self.cache.as_ref(), user_id).await?;

        info!(user_id, "user data deleted");
        Ok(())
    }

    pub async fn set_calendar_enabled(
        &self,
        user_id: &str,
        calendar_id: &str,
        enabled: bool,
    ) -> CalResult<Calendar> {
        let (_, mut calendar) = self.owned_calendar(user_id, calendar_id).await?;

        if calendar.is_enabled != enabled {
            self.store.set_calendar_enabled(calendar_id, enabled).await?;
            calendar.is_enabled = enabled;

            cache::invalidate_user(self.cache.as_ref(), user_id).await?;
            self.dispatcher
                .dispatch(Task::ConflictRescan {
                    user_id: user_id.to_string(),
                })
                .await?;
        }

        Ok(calendar)
    }

    /// Create one event remotely; it reaches the store through the next delta sync.
    pub async fn create_event(
        &self,
        user_id: &str,
        calendar_id: &str,
        draft: &EventDraft,
    ) -> CalResult<CreatedEvent> {
        draft.check()?;
        let (account, calendar) = self.owned_calendar(user_id, calendar_id).await?;

        if !account.is_active {
            return Err(CalError::Conflict(
                "Account is disconnected; reconnect it to create events".to_string(),
            ));
        }
        if calendar.provider_removed {
            return Err(CalError::Conflict(
                "Calendar no longer exists at the provider".to_string(),
            ));
        }

        let provider = self.registry.get(account.provider)?;
        let created = provider.create_event(&account, &calendar, draft).await?;

        self.dispatcher
            .dispatch(Task::DeltaSync {
                account_id: account.id.clone(),
                calendar_id: Some(calendar.id.clone()),
            })
            .await?;

        info!(user_id, calendar_id, external_id = %created.external_id, "event created");
        Ok(created)
    }

    /// Events overlapping [from, to), cached per user version.
    pub async fn list_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CalResult<Vec<Event>> {
        if to <= from {
            return Err(CalError::Validation("Range must end after it starts".to_string()));
        }
        if to - from > Duration::days(MAX_EVENT_RANGE_DAYS) {
            return Err(CalError::Validation(format!(
                "Range is limited to {} days",
                MAX_EVENT_RANGE_DAYS
            )));
        }

        let version = cache::user_cache_version(self.cache.as_ref(), user_id).await?;
        let key = keys::event_list(user_id, &version, from, to);

        if let Some(events) = cache::get_json(self.cache.as_ref(), &key).await? {
            debug!(user_id, "event list served from cache");
            return Ok(events);
        }

        let events = self.store.list_events(user_id, from, to).await?;
        cache::set_json(self.cache.as_ref(), &key, &events, None).await?;
        Ok(events)
    }

    /// Queue a user-requested full sync, subject to the per-account budget.
    pub async fn trigger_sync(&self, user_id: &str, account_id: &str) -> CalResult<()> {
        let account = self.owned_account(user_id, account_id).await?;
        if !account.is_active {
            return Err(CalError::Conflict(
                "Account is disconnected; reconnect it to sync".to_string(),
            ));
        }
        if account.reconnect_required {
            return Err(CalError::ReauthorizationRequired(
                "credential was rejected by the provider".to_string(),
            ));
        }

        self.limiter.check_manual_sync(account_id)?;
        self.dispatcher
            .dispatch(Task::FullSync {
                account_id: account.id,
            })
            .await
    }
}
