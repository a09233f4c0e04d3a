/// Manual sync throttling
///
/// Users may trigger syncs by hand; each connected account gets its own
/// hourly budget so one noisy account cannot hammer a provider.
use crate::config::RateLimitConfig;
use crate::error::{CalError, CalResult};
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter as GovernorLimiter,
};
use std::{num::NonZeroU32, sync::Arc};

type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Per-account limiter for manual sync triggers
#[derive(Clone)]
pub struct SyncRateLimiter {
    enabled: bool,
    manual: Arc<KeyedLimiter>,
    clock: DefaultClock,
}

impl SyncRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let per_hour = NonZeroU32::new(config.manual_syncs_per_hour).unwrap_or(NonZeroU32::MIN);

        Self {
            enabled: config.enabled,
            manual: Arc::new(GovernorLimiter::keyed(Quota::per_hour(per_hour))),
            clock: DefaultClock::default(),
        }
    }

    /// Spend one manual sync for the account.
    pub fn check_manual_sync(&self, account_id: &str) -> CalResult<()> {
        if !self.enabled {
            return Ok(());
        }

        self.manual
            .check_key(&account_id.to_string())
            .map_err(|not_until| CalError::RateLimitExceeded {
                retry_after: not_until.wait_time_from(self.clock.now()),
            })
    }

    /// Forget idle accounts.
    pub fn prune(&self) {
        self.manual.retain_recent();
    }
}
