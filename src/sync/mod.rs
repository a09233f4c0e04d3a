/// Sync engine
///
/// Per connected account: take the account lock, refresh the calendar
/// list, pull each calendar through its adapter, normalize, write the batch
/// and its cursor together, then invalidate caches and queue a conflict
/// rescan when anything changed.

pub mod engine;
pub mod retry;

pub use self::engine::{SyncEngine, SyncOutcome, SyncReport, SyncScope};
pub use self::retry::Backoff;
