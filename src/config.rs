/// Configuration management for calsync
use crate::error::{CalError, CalResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub vault: VaultConfig,
    pub authentication: AuthConfig,
    pub google: OAuthProviderConfig,
    pub microsoft: OAuthProviderConfig,
    pub sync: SyncConfig,
    pub conflicts: ConflictConfig,
    pub webhooks: WebhookConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Externally reachable base URL; webhook callback addresses are built from it
    pub public_url: String,
    pub version: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Use Redis when true, the in-process cache otherwise
    pub enabled: bool,
    pub redis_url: String,
    pub key_prefix: String,
    pub default_ttl_secs: u64,
}

/// Credential vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub master_secret: String,
}

/// Inbound API authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

/// OAuth client settings and endpoints for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base_url: String,
    pub token_url: String,
    pub profile_url: String,
}

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub window_past_days: i64,
    pub window_future_days: i64,
    /// Refresh access tokens expiring within this many minutes
    pub refresh_buffer_minutes: i64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub run_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    pub interval_minutes: u64,
    pub worker_count: usize,
}

/// Conflict detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    pub min_overlap_minutes: i64,
    /// Partial overlaps up to this length are soft
    pub edge_tolerance_minutes: i64,
    pub max_free_slots: usize,
}

/// Push subscription configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub microsoft_subscription_minutes: i64,
    pub google_channel_ttl_hours: i64,
    pub renewal_lead_hours: i64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub manual_syncs_per_hour: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> CalResult<Self> {
        dotenv::dotenv().ok();

        let hostname = var_or("CALSYNC_HOSTNAME", "0.0.0.0");
        let port = var_or("CALSYNC_PORT", "8080")
            .parse()
            .map_err(|_| CalError::Validation("Invalid port number".to_string()))?;
        let public_url = var_or("CALSYNC_PUBLIC_URL", &format!("http://localhost:{}", port));

        let database_url = var_or("CALSYNC_DATABASE_URL", "sqlite://./data/calsync.sqlite?mode=rwc");
        let max_connections = parse_or("CALSYNC_DATABASE_MAX_CONNECTIONS", 10);

        let cache_enabled = parse_or("CALSYNC_REDIS_ENABLED", false);
        let redis_url = var_or("CALSYNC_REDIS_URL", "redis://127.0.0.1:6379");
        let key_prefix = var_or("CALSYNC_CACHE_PREFIX", "calsync:");
        let default_ttl_secs = parse_or("CALSYNC_CACHE_TTL_SECS", 300);

        let master_secret = env::var("CALSYNC_VAULT_SECRET")
            .map_err(|_| CalError::Validation("Vault master secret required".to_string()))?;
        let jwt_secret = env::var("CALSYNC_JWT_SECRET")
            .map_err(|_| CalError::Validation("JWT secret required".to_string()))?;

        let google = OAuthProviderConfig {
            client_id: var_or("GOOGLE_CLIENT_ID", ""),
            client_secret: var_or("GOOGLE_CLIENT_SECRET", ""),
            api_base_url: var_or("GOOGLE_API_BASE_URL", "https://www.googleapis.com/calendar/v3"),
            token_url: var_or("GOOGLE_TOKEN_URL", "https://oauth2.googleapis.com/token"),
            profile_url: var_or(
                "GOOGLE_USERINFO_URL",
                "https://openidconnect.googleapis.com/v1/userinfo",
            ),
        };

        let microsoft = OAuthProviderConfig {
            client_id: var_or("MICROSOFT_CLIENT_ID", ""),
            client_secret: var_or("MICROSOFT_CLIENT_SECRET", ""),
            api_base_url: var_or("MICROSOFT_GRAPH_BASE_URL", "https://graph.microsoft.com/v1.0"),
            token_url: var_or(
                "MICROSOFT_TOKEN_URL",
                "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            ),
            profile_url: var_or("MICROSOFT_PROFILE_URL", "https://graph.microsoft.com/v1.0/me"),
        };

        let sync = SyncConfig {
            window_past_days: parse_or("CALSYNC_SYNC_WINDOW_PAST_DAYS", 30),
            window_future_days: parse_or("CALSYNC_SYNC_WINDOW_FUTURE_DAYS", 90),
            refresh_buffer_minutes: parse_or("CALSYNC_TOKEN_REFRESH_BUFFER_MINUTES", 5),
            max_attempts: parse_or("CALSYNC_SYNC_MAX_ATTEMPTS", 3),
            base_backoff_ms: parse_or("CALSYNC_SYNC_BACKOFF_MS", 1000),
            run_timeout_secs: parse_or("CALSYNC_SYNC_TIMEOUT_SECS", 300),
            lock_ttl_secs: parse_or("CALSYNC_SYNC_LOCK_TTL_SECS", 600),
            interval_minutes: parse_or("CALSYNC_SYNC_INTERVAL_MINUTES", 30),
            worker_count: parse_or("CALSYNC_WORKERS", 4),
        };

        let conflicts = ConflictConfig {
            min_overlap_minutes: parse_or("CALSYNC_CONFLICT_MIN_OVERLAP_MINUTES", 5),
            edge_tolerance_minutes: parse_or("CALSYNC_CONFLICT_EDGE_TOLERANCE_MINUTES", 15),
            max_free_slots: parse_or("CALSYNC_FREE_SLOT_LIMIT", 5),
        };

        let webhooks = WebhookConfig {
            // Graph caps calendar subscriptions just under three days
            microsoft_subscription_minutes: parse_or("CALSYNC_MS_SUBSCRIPTION_MINUTES", 4200),
            google_channel_ttl_hours: parse_or("CALSYNC_GOOGLE_CHANNEL_TTL_HOURS", 168),
            renewal_lead_hours: parse_or("CALSYNC_PUSH_RENEWAL_LEAD_HOURS", 24),
        };

        let rate_limit = RateLimitConfig {
            enabled: parse_or("CALSYNC_RATE_LIMITS_ENABLED", true),
            manual_syncs_per_hour: parse_or("CALSYNC_MANUAL_SYNCS_PER_HOUR", 12),
        };

        let logging = LoggingConfig {
            level: var_or("RUST_LOG", "info"),
            format: var_or("LOG_FORMAT", "pretty"),
        };

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                public_url,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            storage: StorageConfig {
                database_url,
                max_connections,
            },
            cache: CacheConfig {
                enabled: cache_enabled,
                redis_url,
                key_prefix,
                default_ttl_secs,
            },
            vault: VaultConfig { master_secret },
            authentication: AuthConfig { jwt_secret },
            google,
            microsoft,
            sync,
            conflicts,
            webhooks,
            rate_limit,
            logging,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> CalResult<()> {
        if self.service.hostname.is_empty() {
            return Err(CalError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.vault.master_secret.len() < 32 {
            return Err(CalError::Validation(
                "Vault master secret must be at least 32 characters".to_string(),
            ));
        }

        if self.authentication.jwt_secret.len() < 32 {
            return Err(CalError::Validation(
                "JWT secret must be at least 32 characters".to_string(),
            ));
        }

        if self.sync.max_attempts == 0 || self.sync.worker_count == 0 {
            return Err(CalError::Validation(
                "Sync attempts and worker count must be positive".to_string(),
            ));
        }

        if self.sync.lock_ttl_secs <= self.sync.run_timeout_secs {
            return Err(CalError::Validation(
                "Sync lock TTL must exceed the sync run timeout".to_string(),
            ));
        }

        if self.sync.window_past_days < 0 || self.sync.window_future_days <= 0 {
            return Err(CalError::Validation("Invalid sync window".to_string()));
        }

        Ok(())
    }

    /// Configuration used by unit tests; endpoints point nowhere.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        let provider = |name: &str| OAuthProviderConfig {
            client_id: format!("{}-client", name),
            client_secret: format!("{}-secret", name),
            api_base_url: "http://127.0.0.1:9".to_string(),
            token_url: "http://127.0.0.1:9/token".to_string(),
            profile_url: "http://127.0.0.1:9/me".to_string(),
        };

        ServerConfig {
            service: ServiceConfig {
                hostname: "127.0.0.1".to_string(),
                port: 8080,
                public_url: "https://calsync.test".to_string(),
                version: "test".to_string(),
            },
            storage: StorageConfig {
                database_url: "sqlite::memory:".to_string(),
                max_connections: 1,
            },
            cache: CacheConfig {
                enabled: false,
                redis_url: String::new(),
                key_prefix: "test:".to_string(),
                default_ttl_secs: 60,
            },
            vault: VaultConfig {
                master_secret: "test-master-secret-that-is-long-enough".to_string(),
            },
            authentication: AuthConfig {
                jwt_secret: "test-jwt-secret-that-is-long-enough-too".to_string(),
            },
            google: provider("google"),
            microsoft: provider("microsoft"),
            sync: SyncConfig {
                window_past_days: 30,
                window_future_days: 90,
                refresh_buffer_minutes: 5,
                max_attempts: 3,
                base_backoff_ms: 1,
                run_timeout_secs: 5,
                lock_ttl_secs: 10,
                interval_minutes: 30,
                worker_count: 2,
            },
            conflicts: ConflictConfig {
                min_overlap_minutes: 5,
                edge_tolerance_minutes: 15,
                max_free_slots: 5,
            },
            webhooks: WebhookConfig {
                microsoft_subscription_minutes: 4200,
                google_channel_ttl_hours: 168,
                renewal_lead_hours: 24,
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                manual_syncs_per_hour: 12,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_short_secrets() {
        let mut config = ServerConfig::for_tests();
        assert!(config.validate().is_ok());

        config.vault.master_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_lock_ttl_must_cover_timeout() {
        let mut config = ServerConfig::for_tests();
        config.sync.lock_ttl_secs = config.sync.run_timeout_secs;
        assert!(config.validate().is_err());
    }
}
