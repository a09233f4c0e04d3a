/// Application context and dependency injection
use crate::{
    account::AccountManager,
    cache::{Cache, MemoryCache, RedisCache},
    config::ServerConfig,
    conflicts::ConflictDetector,
    db,
    error::{CalError, CalResult},
    jobs::{QueueDispatcher, Task, TaskDispatcher, TaskRunner, WorkerPool},
    providers::{CredentialManager, ProviderRegistry},
    rate_limit::SyncRateLimiter,
    store::{SqliteStore, Store},
    sync::SyncEngine,
    vault::CredentialVault,
    webhooks::WebhookIngress,
};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub engine: Arc<SyncEngine>,
    pub detector: Arc<ConflictDetector>,
    pub accounts: Arc<AccountManager>,
    pub webhooks: Arc<WebhookIngress>,
    pub task_runner: Arc<TaskRunner>,
    pub rate_limiter: SyncRateLimiter,
    task_queue: Arc<Mutex<Option<UnboundedReceiver<Task>>>>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> CalResult<Self> {
        // Validate configuration
        config.validate()?;

        // Database
        let db = db::create_pool(&config.storage).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;
        info!("Database ready at {}", config.storage.database_url);

        // Cache and locks
        let cache: Arc<dyn Cache> = if config.cache.enabled {
            Arc::new(RedisCache::connect(&config.cache).await?)
        } else {
            info!("Redis disabled, using in-process cache");
            Arc::new(MemoryCache::new(Duration::from_secs(
                config.cache.default_ttl_secs,
            )))
        };

        let registry_config = config.clone();
        Self::assemble(config, db, cache, move |credentials| {
            ProviderRegistry::from_config(&registry_config, credentials)
        })
    }

    /// Wire every service on top of a database, a cache and a provider registry.
    pub fn assemble<F>(config: ServerConfig, db: SqlitePool, cache: Arc<dyn Cache>, registry: F) -> CalResult<Self>
    where
        F: FnOnce(CredentialManager) -> CalResult<ProviderRegistry>,
    {
        let config = Arc::new(config);
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(db.clone()));
        let vault = Arc::new(CredentialVault::new(&config.vault.master_secret));
        let credentials = CredentialManager::new(
            store.clone(),
            vault,
            config.sync.refresh_buffer_minutes,
        );
        let registry = registry(credentials.clone())?;

        let (queue, receiver) = QueueDispatcher::new();
        let dispatcher: Arc<dyn TaskDispatcher> = Arc::new(queue);
        let rate_limiter = SyncRateLimiter::new(&config.rate_limit);

        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            cache.clone(),
            registry.clone(),
            dispatcher.clone(),
            config.sync.clone(),
        ));
        let detector = Arc::new(ConflictDetector::new(
            store.clone(),
            cache.clone(),
            config.conflicts.clone(),
        ));
        let accounts = Arc::new(AccountManager::new(
            store.clone(),
            cache.clone(),
            registry.clone(),
            credentials,
            dispatcher.clone(),
            rate_limiter.clone(),
        ));
        let webhooks = Arc::new(WebhookIngress::new(store.clone(), dispatcher.clone()));
        let task_runner = Arc::new(TaskRunner::new(
            store.clone(),
            registry,
            engine.clone(),
            detector.clone(),
            config.webhooks.clone(),
        ));

        Ok(Self {
            config,
            db,
            store,
            cache,
            dispatcher,
            engine,
            detector,
            accounts,
            webhooks,
            task_runner,
            rate_limiter,
            task_queue: Arc::new(Mutex::new(Some(receiver))),
        })
    }

    /// Start the worker pool draining the task queue. Only the first call has an effect.
    pub fn start_workers(&self) -> CalResult<Vec<JoinHandle<()>>> {
        let receiver = self
            .task_queue
            .lock()
            .map_err(|_| CalError::Internal("task queue lock poisoned".to_string()))?
            .take();

        match receiver {
            Some(receiver) => Ok(WorkerPool::spawn(
                receiver,
                self.task_runner.clone(),
                self.config.sync.worker_count,
            )),
            None => {
                warn!("Workers already started");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
impl AppContext {
    /// In-memory context with the given registry
    pub async fn for_tests(registry: ProviderRegistry) -> Self {
        let db = db::test_pool().await;
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        Self::assemble(ServerConfig::for_tests(), db, cache, move |_| Ok(registry)).unwrap()
    }

    /// Take the undrained task queue so a test can observe what was enqueued
    pub fn task_queue_for_tests(&self) -> UnboundedReceiver<Task> {
        self.task_queue.lock().unwrap().take().unwrap()
    }
}
