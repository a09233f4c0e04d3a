/// In-process cache backend
use super::{Cache, LockToken};
use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Single-instance cache with TTL expiry and lock support
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl MemoryCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn lock_entries(&self) -> CalResult<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| CalError::Cache("memory cache poisoned".to_string()))
    }
}

fn live(entry: &Entry, now: Instant) -> bool {
    entry.expires_at > now
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> CalResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.lock_entries()?;
        match entries.get(key) {
            Some(entry) if live(entry, now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CalResult<()> {
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        self.lock_entries()?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> CalResult<()> {
        self.lock_entries()?.remove(key);
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> CalResult<Option<LockToken>> {
        let now = Instant::now();
        let mut entries = self.lock_entries()?;
        if entries.get(key).is_some_and(|entry| live(entry, now)) {
            return Ok(None);
        }

        let token = LockToken::generate();
        entries.insert(
            key.to_string(),
            Entry {
                value: token.0.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> CalResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock_entries()?;
        let owned = entries
            .get(key)
            .is_some_and(|entry| live(entry, now) && entry.value == token.0);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn ping(&self) -> CalResult<()> {
        self.lock_entries().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let ttl = Duration::from_secs(10);

        let token = cache.acquire_lock("lock", ttl).await.unwrap().unwrap();
        assert!(cache.acquire_lock("lock", ttl).await.unwrap().is_none());

        // A stale token must not release someone else's lock
        assert!(!cache
            .release_lock("lock", &LockToken("other".to_string()))
            .await
            .unwrap());
        assert!(cache.acquire_lock("lock", ttl).await.unwrap().is_none());

        assert!(cache.release_lock("lock", &token).await.unwrap());
        assert!(cache.acquire_lock("lock", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_expires() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let first = cache
            .acquire_lock("lock", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(first.is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache
            .acquire_lock("lock", Duration::from_secs(1))
            .await
            .unwrap()
            .is_some());
    }
}
