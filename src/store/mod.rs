/// Persistent store interface
///
/// Everything the engine reads or writes goes through [`Store`], so the
/// sync engine, webhook ingress and conflict detector can be exercised
/// against an in-memory SQLite database in tests.

pub mod sqlite;

pub use self::sqlite::SqliteStore;

use crate::db::models::{
    Calendar, ConflictFlag, ConflictStatus, ConnectedAccount, Credential, Event,
    NormalizedEvent, ProviderKind, PushSubscription, SyncStatus,
};
use crate::error::CalResult;
use crate::providers::{FetchWindow, RemoteCalendar, SyncCursor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Normalized changes for one calendar plus the cursor that follows them
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub user_id: String,
    pub account_id: String,
    pub calendar_id: String,
    pub provider: ProviderKind,
    pub upserts: Vec<NormalizedEvent>,
    /// Provider event ids reported deleted
    pub removals: Vec<String>,
    /// Full fetch: live events in the window whose id was not seen get soft-deleted
    pub snapshot: Option<(FetchWindow, HashSet<String>)>,
    /// Written after the events in the same transaction; `None` clears it
    pub next_cursor: Option<SyncCursor>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub upserted: u64,
    pub removed: u64,
}

impl BatchOutcome {
    pub fn changed(&self) -> bool {
        self.upserted + self.removed > 0
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // Accounts

    /// Upsert by (user, provider, provider account id) together with its credential.
    async fn connect_account(
        &self,
        account: &ConnectedAccount,
        credential: &Credential,
    ) -> CalResult<ConnectedAccount>;

    async fn get_account(&self, account_id: &str) -> CalResult<Option<ConnectedAccount>>;

    async fn list_accounts_for_user(&self, user_id: &str) -> CalResult<Vec<ConnectedAccount>>;

    /// Active accounts that do not need reconnecting.
    async fn list_active_accounts(&self) -> CalResult<Vec<ConnectedAccount>>;

    /// `Synced` also stamps `last_synced_at`.
    async fn set_sync_status(
        &self,
        account_id: &str,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> CalResult<()>;

    /// Sync status `error` plus the reconnect marker; automatic syncs skip the
    /// account until `connect_account` clears it.
    async fn mark_reconnect_required(&self, account_id: &str, error_message: &str) -> CalResult<()>;

    /// Soft delete: drop credential, cursors and push subscriptions; keep calendars and events.
    async fn deactivate_account(&self, account_id: &str) -> CalResult<()>;

    /// Hard delete everything belonging to a user.
    async fn delete_user_data(&self, user_id: &str) -> CalResult<()>;

    // Credentials

    async fn get_credential(&self, account_id: &str) -> CalResult<Option<Credential>>;

    /// Last writer wins.
    async fn save_credential(&self, credential: &Credential) -> CalResult<()>;

    // Calendars

    async fn list_calendars(&self, account_id: &str) -> CalResult<Vec<Calendar>>;

    async fn get_calendar(&self, calendar_id: &str) -> CalResult<Option<Calendar>>;

    async fn upsert_calendar(&self, account_id: &str, remote: &RemoteCalendar)
        -> CalResult<Calendar>;

    async fn mark_calendar_removed(&self, calendar_id: &str) -> CalResult<()>;

    async fn set_calendar_enabled(&self, calendar_id: &str, enabled: bool) -> CalResult<()>;

    // Events and cursors

    async fn get_cursor(&self, calendar_id: &str) -> CalResult<Option<SyncCursor>>;

    async fn clear_cursor(&self, calendar_id: &str) -> CalResult<()>;

    /// Apply a batch atomically, writing the cursor last.
    async fn apply_event_batch(&self, batch: &EventBatch) -> CalResult<BatchOutcome>;

    async fn get_event(&self, event_id: &str) -> CalResult<Option<Event>>;

    /// Live events of enabled calendars of active accounts overlapping [from, to).
    async fn list_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CalResult<Vec<Event>>;

    /// Live, non-cancelled, timed events of enabled calendars of active accounts.
    async fn conflict_candidates(&self, user_id: &str) -> CalResult<Vec<Event>>;

    // Conflict flags

    async fn list_conflict_flags(
        &self,
        user_id: &str,
        status: Option<ConflictStatus>,
    ) -> CalResult<Vec<ConflictFlag>>;

    async fn get_conflict_flag(&self, flag_id: &str) -> CalResult<Option<ConflictFlag>>;

    /// Upsert by event pair in one transaction.
    async fn save_conflict_flags(&self, flags: &[ConflictFlag]) -> CalResult<()>;

    // Push subscriptions

    async fn save_push_subscription(&self, subscription: &PushSubscription) -> CalResult<()>;

    async fn find_push_subscription(&self, channel_id: &str)
        -> CalResult<Option<PushSubscription>>;

    async fn list_push_subscriptions(&self, account_id: &str) -> CalResult<Vec<PushSubscription>>;

    async fn list_expiring_push_subscriptions(
        &self,
        before: DateTime<Utc>,
    ) -> CalResult<Vec<PushSubscription>>;

    async fn delete_push_subscription(&self, subscription_id: &str) -> CalResult<()>;
}
