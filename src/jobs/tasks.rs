/// Background task implementations
use super::Task;
use crate::conflicts::ConflictDetector;
use crate::config::WebhookConfig;
use crate::context::AppContext;
use crate::db::models::PushSubscription;
use crate::error::{CalError, CalResult, ProviderError};
use crate::providers::{PushHandle, ProviderRegistry};
use crate::store::Store;
use crate::sync::{SyncEngine, SyncOutcome, SyncScope};
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executes dequeued tasks
pub struct TaskRunner {
    store: Arc<dyn Store>,
    registry: ProviderRegistry,
    engine: Arc<SyncEngine>,
    detector: Arc<ConflictDetector>,
    webhooks: WebhookConfig,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ProviderRegistry,
        engine: Arc<SyncEngine>,
        detector: Arc<ConflictDetector>,
        webhooks: WebhookConfig,
    ) -> Self {
        Self {
            store,
            registry,
            engine,
            detector,
            webhooks,
        }
    }

    pub async fn run(&self, task: Task) -> CalResult<()> {
        match task {
            Task::SetupAccount { account_id } => self.setup_account(&account_id).await.map(|_| ()),
            Task::FullSync { account_id } => self.full_sync(&account_id).await,
            Task::DeltaSync {
                account_id,
                calendar_id,
            } => {
                let scope = calendar_id.map(SyncScope::Calendar).unwrap_or(SyncScope::Account);
                self.engine.sync_account(&account_id, scope).await.map(|_| ())
            }
            Task::ConflictRescan { user_id } => self.detector.scan(&user_id).await.map(|_| ()),
            Task::RenewSubscriptions => self.renew_subscriptions().await.map(|_| ()),
        }
    }

    /// First sync of a new account, then push registration for its calendars.
    ///
    /// A failed first sync still registers push for the calendars already
    /// known; only a rejected credential stops here. Returns the number of
    /// subscriptions created.
    pub async fn setup_account(&self, account_id: &str) -> CalResult<usize> {
        match self.engine.sync_account(account_id, SyncScope::Account).await {
            Ok(_) => {}
            Err(e) if e.requires_reauthorization() => return Err(e),
            Err(e) => warn!(account_id, "initial sync failed, registering push anyway: {}", e),
        }

        let created = self.ensure_push(account_id).await?;
        info!(account_id, created, "account setup finished");
        Ok(created)
    }

    /// Scheduled or manual sync of every calendar. Calendars discovered since
    /// setup, or left without a channel by a failed setup, get one afterwards.
    pub async fn full_sync(&self, account_id: &str) -> CalResult<()> {
        let outcome = self.engine.sync_account(account_id, SyncScope::Account).await?;
        if matches!(outcome, SyncOutcome::Completed(_)) {
            if let Err(e) = self.ensure_push(account_id).await {
                warn!(account_id, "push registration after sync failed: {}", e);
            }
        }
        Ok(())
    }

    /// Register push for calendars without a live subscription.
    ///
    /// Safe to run repeatedly: calendars that already have one are left alone.
    pub async fn ensure_push(&self, account_id: &str) -> CalResult<usize> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| CalError::NotFound(format!("Account {} not found", account_id)))?;
        if !account.is_active || account.reconnect_required {
            return Ok(0);
        }
        let provider = self.registry.get(account.provider)?;

        let subscribed: HashSet<String> = self
            .store
            .list_push_subscriptions(account_id)
            .await?
            .into_iter()
            .filter(|s| s.expires_at > Utc::now())
            .map(|s| s.calendar_id)
            .collect();

        let mut created = 0;
        for calendar in self.store.list_calendars(account_id).await? {
            if calendar.provider_removed || subscribed.contains(&calendar.id) {
                continue;
            }

            match provider.register_push(&account, &calendar).await {
                Ok(handle) => {
                    let subscription = subscription_from_handle(
                        Uuid::new_v4().to_string(),
                        &account.id,
                        &calendar.id,
                        account.provider,
                        handle,
                    );
                    self.store.save_push_subscription(&subscription).await?;
                    created += 1;
                }
                Err(CalError::Provider(ProviderError::Unsupported(_))) => {
                    debug!(provider = %account.provider, "push not supported, relying on periodic sync");
                    break;
                }
                Err(e) => {
                    // Periodic sync still covers this calendar
                    warn!(calendar_id = %calendar.id, "push registration failed: {}", e);
                }
            }
        }

        Ok(created)
    }

    /// Renew push subscriptions expiring within the configured lead time.
    pub async fn renew_subscriptions(&self) -> CalResult<u64> {
        let horizon = Utc::now() + Duration::hours(self.webhooks.renewal_lead_hours);
        let expiring = self.store.list_expiring_push_subscriptions(horizon).await?;
        let mut renewed = 0;

        for subscription in expiring {
            let account = self.store.get_account(&subscription.account_id).await?;
            let calendar = self.store.get_calendar(&subscription.calendar_id).await?;

            let (account, calendar) = match (account, calendar) {
                (Some(account), Some(calendar))
                    if account.is_active
                        && !account.reconnect_required
                        && !calendar.provider_removed =>
                {
                    (account, calendar)
                }
                _ => {
                    debug!(subscription_id = %subscription.id, "dropping subscription of inactive account or calendar");
                    self.store.delete_push_subscription(&subscription.id).await?;
                    continue;
                }
            };

            let provider = self.registry.get(account.provider)?;
            match provider.renew_push(&account, &calendar, &subscription).await {
                Ok(handle) => {
                    let updated = subscription_from_handle(
                        subscription.id.clone(),
                        &account.id,
                        &calendar.id,
                        account.provider,
                        handle,
                    );
                    self.store.save_push_subscription(&updated).await?;
                    renewed += 1;
                }
                Err(e) if e.requires_reauthorization() => {
                    warn!(account_id = %account.id, "cannot renew push subscription, account needs reconnecting");
                }
                Err(e) => {
                    warn!(subscription_id = %subscription.id, "push renewal failed: {}", e);
                }
            }
        }

        if renewed > 0 {
            info!("Renewed {} push subscriptions", renewed);
        }
        Ok(renewed)
    }
}

fn subscription_from_handle(
    id: String,
    account_id: &str,
    calendar_id: &str,
    provider: crate::db::models::ProviderKind,
    handle: PushHandle,
) -> PushSubscription {
    PushSubscription {
        id,
        account_id: account_id.to_string(),
        calendar_id: calendar_id.to_string(),
        provider,
        channel_id: handle.channel_id,
        resource_id: handle.resource_id,
        client_state: handle.client_state,
        expires_at: handle.expires_at,
    }
}

/// Enqueue a full sync for every active account
pub async fn enqueue_periodic_syncs(ctx: &AppContext) -> CalResult<u64> {
    let accounts = ctx.store.list_active_accounts().await?;
    let mut enqueued = 0;

    for account in accounts {
        ctx.dispatcher
            .dispatch(Task::FullSync {
                account_id: account.id,
            })
            .await?;
        enqueued += 1;
    }

    Ok(enqueued)
}

/// Health check - verify database and cache are reachable
pub async fn health_check(ctx: &AppContext) -> CalResult<()> {
    crate::db::test_connection(&ctx.db).await?;
    ctx.cache.ping().await?;
    ctx.rate_limiter.prune();
    Ok(())
}
