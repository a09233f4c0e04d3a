/// Caching and distributed locking
///
/// Provides:
/// - Short-TTL JSON read caches (event lists, conflict lists)
/// - Per-user cache versioning for bulk invalidation
/// - Per-account mutual exclusion for sync runs
///
/// `RedisCache` backs multi-instance deployments; `MemoryCache` is the
/// in-process fallback with the same TTL and lock semantics.

pub mod memory;
pub mod redis_cache;

pub use self::memory::MemoryCache;
pub use self::redis_cache::RedisCache;

use crate::error::CalResult;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::warn;

/// Proof of lock ownership; only the holder can release the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn generate() -> Self {
        LockToken(uuid::Uuid::new_v4().to_string())
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> CalResult<Option<String>>;

    /// `ttl = None` uses the backend default.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CalResult<()>;

    async fn del(&self, key: &str) -> CalResult<()>;

    /// Returns `None` when somebody else holds the lock.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> CalResult<Option<LockToken>>;

    /// Returns false when the lock had already expired or changed hands.
    async fn release_lock(&self, key: &str, token: &LockToken) -> CalResult<bool>;

    async fn ping(&self) -> CalResult<()>;
}

/// Read and decode a JSON value; undecodable entries are dropped and reported as a miss.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> CalResult<Option<T>> {
    match cache.get(key).await? {
        Some(json) => match serde_json::from_str(&json) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Failed to deserialize cached value for {}: {}", key, e);
                cache.del(key).await?;
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> CalResult<()> {
    let json = serde_json::to_string(value)?;
    cache.set(key, &json, ttl).await
}

/// Current cache generation for a user. Read caches embed it in their keys.
pub async fn user_cache_version(cache: &dyn Cache, user_id: &str) -> CalResult<String> {
    let key = keys::user_version(user_id);
    if let Some(version) = cache.get(&key).await? {
        return Ok(version);
    }

    let version = uuid::Uuid::new_v4().simple().to_string();
    cache
        .set(&key, &version, Some(Duration::from_secs(USER_VERSION_TTL_SECS)))
        .await?;
    Ok(version)
}

/// Drop every read cache of a user at once.
pub async fn invalidate_user(cache: &dyn Cache, user_id: &str) -> CalResult<()> {
    cache.del(&keys::user_version(user_id)).await
}

const USER_VERSION_TTL_SECS: u64 = 86_400;

/// Cache key builders
pub mod keys {
    use chrono::{DateTime, Utc};

    pub fn account_lock(account_id: &str) -> String {
        format!("lock:sync:{}", account_id)
    }

    pub fn user_version(user_id: &str) -> String {
        format!("user:version:{}", user_id)
    }

    pub fn event_list(
        user_id: &str,
        version: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> String {
        format!(
            "events:{}:{}:{}:{}",
            user_id,
            version,
            from.timestamp(),
            to.timestamp()
        )
    }

    pub fn conflict_list(user_id: &str, version: &str, status: &str) -> String {
        format!("conflicts:{}:{}:{}", user_id, version, status)
    }
}
