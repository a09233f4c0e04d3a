use super::retry::Backoff;
use crate::cache::{self, keys, Cache};
use crate::config::SyncConfig;
use crate::db::models::{Calendar, ConnectedAccount, SyncStatus};
use crate::error::{CalError, CalResult, ProviderError};
use crate::jobs::{Task, TaskDispatcher};
use crate::normalize::{normalize, Normalized};
use crate::providers::{CalendarProvider, EventPage, ProviderRegistry, RawEvent};
use crate::store::{BatchOutcome, EventBatch, Store};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What a sync run covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// Calendar discovery plus every calendar of the account
    Account,
    /// One calendar, by local id
    Calendar(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub calendars: usize,
    pub upserted: u64,
    pub removed: u64,
    /// Events the normalizer rejected
    pub skipped: usize,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.upserted + self.removed > 0
    }

    fn absorb(&mut self, outcome: BatchOutcome, skipped: usize) {
        self.calendars += 1;
        self.upserted += outcome.upserted;
        self.removed += outcome.removed;
        self.skipped += skipped;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another run holds the account lock, or the account is inactive
    Skipped,
}

/// Orchestrates sync runs for connected accounts
pub struct SyncEngine {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    registry: ProviderRegistry,
    dispatcher: Arc<dyn TaskDispatcher>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        registry: ProviderRegistry,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            dispatcher,
            config,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.max_attempts, self.config.base_backoff())
    }

    /// Run one sync for an account.
    ///
    /// Returns [`SyncOutcome::Skipped`] without touching anything when a run
    /// is already in flight for the account.
    #[instrument(skip(self), fields(provider))]
    pub async fn sync_account(&self, account_id: &str, scope: SyncScope) -> CalResult<SyncOutcome> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| CalError::NotFound(format!("Account {} not found", account_id)))?;
        tracing::Span::current().record("provider", account.provider.as_str());

        if !account.is_active {
            debug!("account is disconnected, skipping sync");
            return Ok(SyncOutcome::Skipped);
        }
        if account.reconnect_required {
            debug!("account needs reconnecting, skipping sync");
            return Ok(SyncOutcome::Skipped);
        }

        let lock_key = keys::account_lock(account_id);
        let Some(token) = self
            .cache
            .acquire_lock(&lock_key, self.config.lock_ttl())
            .await?
        else {
            debug!("sync already in flight, dropping trigger");
            return Ok(SyncOutcome::Skipped);
        };

        let result = self.locked_run(&account, scope).await;

        match self.cache.release_lock(&lock_key, &token).await {
            Ok(true) => {}
            Ok(false) => warn!("sync lock expired before the run finished"),
            Err(e) => warn!("failed to release sync lock: {}", e),
        }

        result.map(SyncOutcome::Completed)
    }

    async fn locked_run(&self, account: &ConnectedAccount, scope: SyncScope) -> CalResult<SyncReport> {
        let provider_label = account.provider.as_str();
        let started = Instant::now();
        self.store
            .set_sync_status(&account.id, SyncStatus::Syncing, None)
            .await?;

        // Calendars commit one by one; the report holds whatever landed even if the run fails
        let mut report = SyncReport::default();
        let result = match tokio::time::timeout(
            self.config.run_timeout(),
            self.run(account, &scope, &mut report),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CalError::Timeout(format!(
                "sync exceeded {}s",
                self.config.run_timeout_secs
            ))),
        };
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                self.store
                    .set_sync_status(&account.id, SyncStatus::Synced, None)
                    .await?;
                crate::metrics::record_sync_run(provider_label, "success", elapsed);
                info!(
                    calendars = report.calendars,
                    upserted = report.upserted,
                    removed = report.removed,
                    skipped = report.skipped,
                    "sync finished"
                );
                self.publish_changes(account, &report).await;
                Ok(report)
            }
            Err(e) => {
                let outcome = if e.requires_reauthorization() {
                    "reauthorization"
                } else {
                    "error"
                };
                warn!(outcome, "sync failed: {}", e);
                crate::metrics::record_sync_run(provider_label, outcome, elapsed);
                if e.requires_reauthorization() {
                    self.store
                        .mark_reconnect_required(&account.id, &e.user_message())
                        .await?;
                } else {
                    self.store
                        .set_sync_status(&account.id, SyncStatus::Error, Some(&e.user_message()))
                        .await?;
                }
                if report.changed() {
                    debug!(
                        upserted = report.upserted,
                        removed = report.removed,
                        "publishing calendars committed before the failure"
                    );
                }
                self.publish_changes(account, &report).await;
                Err(e)
            }
        }
    }

    /// Cache invalidation and rescan for batches that committed, whether or
    /// not the rest of the run succeeded.
    async fn publish_changes(&self, account: &ConnectedAccount, report: &SyncReport) {
        if !report.changed() {
            return;
        }

        if let Err(e) = cache::invalidate_user(self.cache.as_ref(), &account.user_id).await {
            warn!("failed to invalidate caches for {}: {}", account.user_id, e);
        }

        let rescan = Task::ConflictRescan {
            user_id: account.user_id.clone(),
        };
        if let Err(e) = self.dispatcher.dispatch(rescan).await {
            warn!("failed to enqueue conflict rescan: {}", e);
        }
    }

    async fn run(
        &self,
        account: &ConnectedAccount,
        scope: &SyncScope,
        report: &mut SyncReport,
    ) -> CalResult<()> {
        let provider = self.registry.get(account.provider)?;

        let calendars = match scope {
            SyncScope::Account => self.refresh_calendars(provider.as_ref(), account).await?,
            SyncScope::Calendar(calendar_id) => {
                let calendar = self
                    .store
                    .get_calendar(calendar_id)
                    .await?
                    .filter(|c| c.account_id == account.id)
                    .ok_or_else(|| {
                        CalError::NotFound(format!("Calendar {} not found", calendar_id))
                    })?;
                vec![calendar]
            }
        };

        let mut first_error = None;

        // Disabled calendars keep syncing; removed ones are unreachable
        for calendar in calendars.iter().filter(|c| !c.provider_removed) {
            match self.sync_calendar(provider.as_ref(), account, calendar).await {
                Ok((outcome, skipped)) => report.absorb(outcome, skipped),
                Err(e) if e.requires_reauthorization() => return Err(e),
                Err(e) => {
                    warn!(calendar_id = %calendar.id, "calendar sync failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Upsert what the provider reports and mark the rest removed.
    pub async fn refresh_calendars(
        &self,
        provider: &dyn CalendarProvider,
        account: &ConnectedAccount,
    ) -> CalResult<Vec<Calendar>> {
        let remote = self
            .backoff()
            .run("list calendars", || provider.list_calendars(account))
            .await?;
        let known = self.store.list_calendars(&account.id).await?;

        let mut calendars = Vec::with_capacity(remote.len());
        for entry in &remote {
            calendars.push(self.store.upsert_calendar(&account.id, entry).await?);
        }

        let reported: HashSet<&str> = remote
            .iter()
            .map(|c| c.provider_calendar_id.as_str())
            .collect();
        for stale in known
            .iter()
            .filter(|c| !c.provider_removed && !reported.contains(c.provider_calendar_id.as_str()))
        {
            info!(calendar_id = %stale.id, "calendar no longer reported by provider, disabling");
            self.store.mark_calendar_removed(&stale.id).await?;
        }

        Ok(calendars)
    }

    #[instrument(skip_all, fields(calendar_id = %calendar.id))]
    async fn sync_calendar(
        &self,
        provider: &dyn CalendarProvider,
        account: &ConnectedAccount,
        calendar: &Calendar,
    ) -> CalResult<(BatchOutcome, usize)> {
        let cursor = self.store.get_cursor(&calendar.id).await?;
        let backoff = self.backoff();

        let page = match backoff
            .run("list events", || {
                provider.list_events(account, calendar, cursor.as_ref())
            })
            .await
        {
            Err(CalError::Provider(ProviderError::CursorInvalidated)) if cursor.is_some() => {
                info!("cursor rejected, falling back to a full fetch");
                self.store.clear_cursor(&calendar.id).await?;
                backoff
                    .run("list events", || provider.list_events(account, calendar, None))
                    .await?
            }
            other => other?,
        };

        let (batch, skipped) = self.build_batch(account, calendar, page);
        let outcome = self.store.apply_event_batch(&batch).await?;
        crate::metrics::record_events_changed(
            account.provider.as_str(),
            outcome.upserted,
            outcome.removed,
        );
        debug!(
            upserted = outcome.upserted,
            removed = outcome.removed,
            skipped,
            "calendar batch written"
        );

        Ok((outcome, skipped))
    }

    fn build_batch(
        &self,
        account: &ConnectedAccount,
        calendar: &Calendar,
        page: EventPage,
    ) -> (EventBatch, usize) {
        let mut upserts = Vec::new();
        let mut removals = Vec::new();
        let mut seen = HashSet::new();
        let mut skipped = 0;

        for raw in &page.events {
            if !matches!(raw, RawEvent::Removed { .. }) {
                // Unparseable events still exist remotely; keep them out of snapshot pruning
                seen.insert(raw.provider_event_id().to_string());
            }

            match normalize(raw, calendar.timezone.as_deref()) {
                Ok(Normalized::Upsert(event)) => upserts.push(event),
                Ok(Normalized::Remove(id)) => removals.push(id),
                Err(e) => {
                    warn!(
                        provider_event_id = raw.provider_event_id(),
                        "skipping event: {}",
                        e
                    );
                    skipped += 1;
                }
            }
        }

        let batch = EventBatch {
            user_id: account.user_id.clone(),
            account_id: account.id.clone(),
            calendar_id: calendar.id.clone(),
            provider: account.provider,
            upserts,
            removals,
            snapshot: page.snapshot.map(|window| (window, seen)),
            next_cursor: page.next_cursor,
        };
        (batch, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::ServerConfig;
    use crate::db::models::ProviderKind;
    use crate::providers::google::GoogleEvent;
    use crate::providers::{FetchWindow, RemoteCalendar, SyncCursor};
    use crate::store::SqliteStore;
    use crate::testing::{seed_account, test_store, FakeProvider, RecordingDispatcher};
    use chrono::{Duration, Utc};
    use std::sync::atomic::Ordering;

    struct Harness {
        engine: SyncEngine,
        store: Arc<SqliteStore>,
        cache: Arc<MemoryCache>,
        provider: Arc<FakeProvider>,
        dispatcher: Arc<RecordingDispatcher>,
    }

    async fn harness() -> Harness {
        harness_with(ServerConfig::for_tests().sync).await
    }

    async fn harness_with(config: SyncConfig) -> Harness {
        let store = Arc::new(test_store().await);
        let cache = Arc::new(MemoryCache::new(std::time::Duration::from_secs(60)));
        let provider = Arc::new(FakeProvider::new(ProviderKind::Google));
        let dispatcher = Arc::new(RecordingDispatcher::new());

        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());

        let engine = SyncEngine::new(
            store.clone(),
            cache.clone(),
            registry,
            dispatcher.clone(),
            config,
        );

        Harness {
            engine,
            store,
            cache,
            provider,
            dispatcher,
        }
    }

    fn google_event(id: &str, hour: u32) -> RawEvent {
        let event: GoogleEvent = serde_json::from_value(serde_json::json!({
            "id": id,
            "summary": id,
            "etag": format!("\"{}\"", id),
            "start": { "dateTime": format!("2030-03-04T{:02}:00:00Z", hour) },
            "end": { "dateTime": format!("2030-03-04T{:02}:00:00Z", hour + 1) },
        }))
        .unwrap();
        RawEvent::Google(event)
    }

    fn window() -> FetchWindow {
        FetchWindow {
            start: Utc::now() - Duration::days(3650),
            end: Utc::now() + Duration::days(3650),
        }
    }

    fn full_page(events: Vec<RawEvent>, token: &str) -> EventPage {
        EventPage {
            events,
            next_cursor: Some(SyncCursor::Google {
                token: token.to_string(),
            }),
            snapshot: Some(window()),
        }
    }

    async fn live_ids(store: &SqliteStore, user: &str) -> Vec<String> {
        let mut ids: Vec<String> = store
            .list_events(user, Utc::now() - Duration::days(3650), Utc::now() + Duration::days(3650))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.data.provider_event_id)
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_first_sync_writes_events_cursor_and_status() {
        let h = harness().await;
        let (account, calendar) = seed_account(&h.store, "user-1").await;
        h.provider
            .push_page(Ok(full_page(vec![google_event("a", 9), google_event("b", 11)], "t1")));

        let outcome = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap();

        let SyncOutcome::Completed(report) = outcome else {
            panic!("sync was skipped");
        };
        assert_eq!(report.upserted, 2);
        assert_eq!(live_ids(&h.store, "user-1").await, vec!["a", "b"]);
        assert_eq!(
            h.store.get_cursor(&calendar.id).await.unwrap(),
            Some(SyncCursor::Google {
                token: "t1".to_string()
            })
        );

        let account = h.store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(account.sync_status, SyncStatus::Synced);
        assert!(account.last_synced_at.is_some());
        assert!(account.error_message.is_none());

        assert_eq!(
            h.dispatcher.recorded(),
            vec![Task::ConflictRescan {
                user_id: "user-1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_incremental_sync_passes_cursor_and_soft_deletes() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        h.provider
            .push_page(Ok(full_page(vec![google_event("a", 9), google_event("b", 11)], "t1")));
        h.provider.push_page(Ok(EventPage {
            events: vec![RawEvent::Removed {
                provider_event_id: "a".to_string(),
            }],
            next_cursor: Some(SyncCursor::Google {
                token: "t2".to_string(),
            }),
            snapshot: None,
        }));

        h.engine.sync_account(&account.id, SyncScope::Account).await.unwrap();
        h.engine.sync_account(&account.id, SyncScope::Account).await.unwrap();

        let cursors = h.provider.cursors_seen.lock().unwrap().clone();
        assert_eq!(cursors[0], None);
        assert_eq!(
            cursors[1],
            Some(SyncCursor::Google {
                token: "t1".to_string()
            })
        );
        assert_eq!(live_ids(&h.store, "user-1").await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_unchanged_sync_does_not_queue_rescan() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;

        // Empty queue: the fake answers with no changes
        h.engine.sync_account(&account.id, SyncScope::Account).await.unwrap();

        assert!(h.dispatcher.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_event_is_skipped_not_fatal() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        let broken: GoogleEvent =
            serde_json::from_value(serde_json::json!({ "id": "broken" })).unwrap();
        h.provider.push_page(Ok(full_page(
            vec![google_event("a", 9), RawEvent::Google(broken)],
            "t1",
        )));

        let outcome = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap();

        assert!(matches!(outcome, SyncOutcome::Completed(SyncReport { upserted: 1, skipped: 1, .. })));
        assert_eq!(live_ids(&h.store, "user-1").await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        h.provider
            .push_page(Err(CalError::Provider(ProviderError::Transient("503".into()))));
        h.provider.push_page(Ok(full_page(vec![google_event("a", 9)], "t1")));

        h.engine.sync_account(&account.id, SyncScope::Account).await.unwrap();

        assert_eq!(h.provider.list_event_calls.load(Ordering::SeqCst), 2);
        let account = h.store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(account.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_error() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        for _ in 0..3 {
            h.provider
                .push_page(Err(CalError::Provider(ProviderError::Transient("503".into()))));
        }

        let err = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(h.provider.list_event_calls.load(Ordering::SeqCst), 3);
        let account = h.store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(account.sync_status, SyncStatus::Error);
        assert!(account.error_message.is_some());
    }

    #[tokio::test]
    async fn test_reauthorization_fails_fast_without_retry() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        h.provider.push_page(Err(CalError::ReauthorizationRequired(
            "invalid_grant".into(),
        )));

        let err = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap_err();

        assert!(err.requires_reauthorization());
        assert_eq!(h.provider.list_event_calls.load(Ordering::SeqCst), 1);
        let account = h.store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(account.sync_status, SyncStatus::Error);
        assert!(account.error_message.unwrap().contains("reconnect"));
        assert!(account.reconnect_required);
        assert!(h.dispatcher.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_account_needing_reconnect_is_not_retried() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        h.provider.push_page(Err(CalError::ReauthorizationRequired(
            "invalid_grant".into(),
        )));
        h.engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap_err();

        // Scheduled and webhook triggers leave the provider alone
        let outcome = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(h.provider.list_event_calls.load(Ordering::SeqCst), 1);
        assert!(h.store.list_active_accounts().await.unwrap().is_empty());

        // Reconnecting clears the marker
        let credential = h.store.get_credential(&account.id).await.unwrap().unwrap();
        let stored = h.store.connect_account(&account, &credential).await.unwrap();
        assert!(!stored.reconnect_required);
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        let outcome = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)));
        assert_eq!(h.provider.list_event_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_held_lock_drops_trigger() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        let _held = h
            .cache
            .acquire_lock(&keys::account_lock(&account.id), std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let outcome = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(h.provider.list_event_calls.load(Ordering::SeqCst), 0);
        let account = h.store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(account.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_collapse_to_one_run() {
        let h = Arc::new(harness().await);
        let (account, _) = seed_account(&h.store, "user-1").await;
        h.provider.set_delay(std::time::Duration::from_millis(200));

        let first = {
            let h = Arc::clone(&h);
            let id = account.id.clone();
            tokio::spawn(async move { h.engine.sync_account(&id, SyncScope::Account).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap();

        assert_eq!(second, SyncOutcome::Skipped);
        assert!(matches!(first.await.unwrap().unwrap(), SyncOutcome::Completed(_)));
        assert_eq!(h.provider.list_event_calls.load(Ordering::SeqCst), 1);

        // Lock released: the next trigger runs
        h.provider.set_delay(std::time::Duration::from_millis(0));
        let third = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap();
        assert!(matches!(third, SyncOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_run_over_budget_is_marked_error_and_unlocked() {
        let config = SyncConfig {
            run_timeout_secs: 1,
            ..ServerConfig::for_tests().sync
        };
        let h = harness_with(config).await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        h.provider.set_delay(std::time::Duration::from_secs(3));

        let err = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap_err();

        assert!(matches!(err, CalError::Timeout(_)));
        let account = h.store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(account.sync_status, SyncStatus::Error);
        assert!(h
            .cache
            .acquire_lock(&keys::account_lock(&account.id), std::time::Duration::from_secs(1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_calendar_discovery_disables_removed_and_syncs_new() {
        let h = harness().await;
        let (account, primary) = seed_account(&h.store, "user-1").await;
        h.provider.set_calendars(vec![RemoteCalendar {
            provider_calendar_id: "team".to_string(),
            name: "Team".to_string(),
            color: Some("#00ff00".to_string()),
            timezone: Some("Europe/Berlin".to_string()),
            is_primary: false,
        }]);

        h.engine.sync_account(&account.id, SyncScope::Account).await.unwrap();

        let calendars = h.store.list_calendars(&account.id).await.unwrap();
        let old = calendars.iter().find(|c| c.id == primary.id).unwrap();
        assert!(old.provider_removed);
        assert!(!old.is_enabled);
        let team = calendars
            .iter()
            .find(|c| c.provider_calendar_id == "team")
            .unwrap();
        assert!(team.is_enabled);

        // Only the live calendar was fetched
        assert_eq!(h.provider.list_event_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_calendar_still_syncs() {
        let h = harness().await;
        let (account, calendar) = seed_account(&h.store, "user-1").await;
        h.store.set_calendar_enabled(&calendar.id, false).await.unwrap();
        h.provider.push_page(Ok(full_page(vec![google_event("a", 9)], "t1")));

        h.engine.sync_account(&account.id, SyncScope::Account).await.unwrap();

        assert_eq!(h.provider.list_event_calls.load(Ordering::SeqCst), 1);
        assert!(h.store.get_cursor(&calendar.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cursor_rejected_by_adapter_falls_back_to_full_fetch() {
        let h = harness().await;
        let (account, calendar) = seed_account(&h.store, "user-1").await;
        h.provider.push_page(Ok(full_page(vec![google_event("a", 9)], "t1")));
        h.engine.sync_account(&account.id, SyncScope::Account).await.unwrap();

        h.provider
            .push_page(Err(CalError::Provider(ProviderError::CursorInvalidated)));
        h.provider.push_page(Ok(full_page(vec![google_event("b", 11)], "t9")));
        h.engine
            .sync_account(&account.id, SyncScope::Calendar(calendar.id.clone()))
            .await
            .unwrap();

        let cursors = h.provider.cursors_seen.lock().unwrap().clone();
        assert_eq!(cursors.len(), 3);
        assert!(cursors[1].is_some());
        assert_eq!(cursors[2], None);
        assert_eq!(live_ids(&h.store, "user-1").await, vec!["b"]);
        assert_eq!(
            h.store.get_cursor(&calendar.id).await.unwrap(),
            Some(SyncCursor::Google {
                token: "t9".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_calendar_scope_rejects_foreign_calendar() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        let (_, other_calendar) = seed_account(&h.store, "user-2").await;

        let err = h
            .engine
            .sync_account(&account.id, SyncScope::Calendar(other_calendar.id))
            .await
            .unwrap_err();
        assert!(matches!(err, CalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_calendar_still_publishes_committed_ones() {
        let h = harness().await;
        let (account, primary) = seed_account(&h.store, "user-1").await;
        h.provider.set_calendars(vec![
            RemoteCalendar {
                provider_calendar_id: "primary".to_string(),
                name: "Primary".to_string(),
                color: None,
                timezone: Some("UTC".to_string()),
                is_primary: true,
            },
            RemoteCalendar {
                provider_calendar_id: "team".to_string(),
                name: "Team".to_string(),
                color: None,
                timezone: Some("UTC".to_string()),
                is_primary: false,
            },
        ]);
        h.provider
            .push_page(Ok(full_page(vec![google_event("a", 9), google_event("b", 9)], "t1")));
        h.provider.push_page(Err(CalError::Provider(ProviderError::Rejected {
            status: 400,
            message: "bad request".to_string(),
        })));
        let before = cache::user_cache_version(h.cache.as_ref(), "user-1").await.unwrap();

        let err = h
            .engine
            .sync_account(&account.id, SyncScope::Account)
            .await
            .unwrap_err();

        assert!(matches!(err, CalError::Provider(ProviderError::Rejected { .. })));
        assert_eq!(live_ids(&h.store, "user-1").await, vec!["a", "b"]);
        assert!(h.store.get_cursor(&primary.id).await.unwrap().is_some());
        let account = h.store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(account.sync_status, SyncStatus::Error);

        // The committed calendar is rescanned and its cached reads dropped
        assert_eq!(
            h.dispatcher.recorded(),
            vec![Task::ConflictRescan {
                user_id: "user-1".to_string()
            }]
        );
        let after = cache::user_cache_version(h.cache.as_ref(), "user-1").await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_sync_invalidates_user_cache() {
        let h = harness().await;
        let (account, _) = seed_account(&h.store, "user-1").await;
        let before = cache::user_cache_version(h.cache.as_ref(), "user-1").await.unwrap();
        h.provider.push_page(Ok(full_page(vec![google_event("a", 9)], "t1")));

        h.engine.sync_account(&account.id, SyncScope::Account).await.unwrap();

        let after = cache::user_cache_version(h.cache.as_ref(), "user-1").await.unwrap();
        assert_ne!(before, after);
    }
}
