/// Redis cache backend
use super::{Cache, LockToken};
use crate::config::CacheConfig;
use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Deletes the lock only while it still carries the caller's token.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis cache client
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
    key_prefix: String,
    default_ttl: Duration,
}

impl RedisCache {
    /// Connect to Redis
    pub async fn connect(config: &CacheConfig) -> CalResult<Self> {
        info!("Connecting to Redis at {}", config.redis_url);

        let client = Client::open(config.redis_url.as_str()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            CalError::Cache(format!("Redis client creation failed: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            CalError::Cache(format!("Redis connection failed: {}", e))
        })?;

        info!("✓ Redis connection established");

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
        })
    }

    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> CalResult<Option<String>> {
        let cache_key = self.build_key(key);
        let mut conn = self.connection.clone();

        let result: Option<String> = conn.get(&cache_key).await.map_err(|e| {
            warn!("Redis GET failed for {}: {}", cache_key, e);
            CalError::Cache(format!("Cache get failed: {}", e))
        })?;

        debug!(
            "Cache {}: {}",
            if result.is_some() { "HIT" } else { "MISS" },
            cache_key
        );
        Ok(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CalResult<()> {
        let cache_key = self.build_key(key);
        let ttl = ttl.unwrap_or(self.default_ttl).as_secs().max(1);
        let mut conn = self.connection.clone();

        conn.set_ex::<_, _, ()>(&cache_key, value, ttl)
            .await
            .map_err(|e| {
                warn!("Redis SET failed for {}: {}", cache_key, e);
                CalError::Cache(format!("Cache set failed: {}", e))
            })?;

        Ok(())
    }

    async fn del(&self, key: &str) -> CalResult<()> {
        let cache_key = self.build_key(key);
        let mut conn = self.connection.clone();

        conn.del::<_, ()>(&cache_key).await.map_err(|e| {
            warn!("Redis DELETE failed for {}: {}", cache_key, e);
            CalError::Cache(format!("Cache delete failed: {}", e))
        })?;

        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> CalResult<Option<LockToken>> {
        let cache_key = self.build_key(key);
        let token = LockToken::generate();
        let mut conn = self.connection.clone();

        // SET key token NX PX ttl -> "OK" or nil
        let reply: Option<String> = redis::cmd("SET")
            .arg(&cache_key)
            .arg(&token.0)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| token))
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> CalResult<bool> {
        let cache_key = self.build_key(key);
        let mut conn = self.connection.clone();

        let deleted: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(&cache_key)
            .arg(&token.0)
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }

    async fn ping(&self) -> CalResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            error!("Redis PING failed: {}", e);
            CalError::Cache(format!("Cache ping failed: {}", e))
        })?;

        if pong != "PONG" {
            return Err(CalError::Cache("Unexpected Redis PING response".to_string()));
        }

        Ok(())
    }
}
