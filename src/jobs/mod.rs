/// Background work: task queue, worker pool and periodic jobs
///
/// Sync runs, conflict rescans and push-subscription maintenance are
/// [`Task`]s handed to a [`TaskDispatcher`]. The in-process
/// [`QueueDispatcher`] feeds a [`WorkerPool`]; the [`JobScheduler`] enqueues
/// the periodic work.
use crate::context::AppContext;
use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

pub mod tasks;

pub use self::tasks::TaskRunner;

/// Unit of background work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    /// First sync of a freshly connected account, then push registration
    SetupAccount { account_id: String },
    /// Calendar discovery plus sync of every calendar
    FullSync { account_id: String },
    /// Sync of one calendar (or every calendar when `calendar_id` is absent)
    DeltaSync {
        account_id: String,
        calendar_id: Option<String>,
    },
    ConflictRescan { user_id: String },
    RenewSubscriptions,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::SetupAccount { .. } => "setup_account",
            Task::FullSync { .. } => "full_sync",
            Task::DeltaSync { .. } => "delta_sync",
            Task::ConflictRescan { .. } => "conflict_rescan",
            Task::RenewSubscriptions => "renew_subscriptions",
        }
    }
}

/// At-least-once task submission
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: Task) -> CalResult<()>;
}

/// Dispatcher backed by an in-process channel
#[derive(Clone)]
pub struct QueueDispatcher {
    sender: mpsc::UnboundedSender<Task>,
}

impl QueueDispatcher {
    /// Dispatcher plus the receiving end for [`WorkerPool::spawn`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TaskDispatcher for QueueDispatcher {
    async fn dispatch(&self, task: Task) -> CalResult<()> {
        debug!(task = task.name(), "enqueueing task");
        self.sender
            .send(task)
            .map_err(|_| CalError::Internal("task queue is closed".to_string()))
    }
}

/// Fixed set of workers draining one queue
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(
        receiver: mpsc::UnboundedReceiver<Task>,
        runner: Arc<TaskRunner>,
        workers: usize,
    ) -> Vec<JoinHandle<()>> {
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = workers.max(1);
        info!("Starting {} background workers", workers);

        (0..workers)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(task) = next else {
                            debug!(worker, "task queue closed, worker exiting");
                            break;
                        };
                        Self::execute(&runner, task).await;
                    }
                })
            })
            .collect()
    }

    async fn execute(runner: &TaskRunner, task: Task) {
        let name = task.name();
        let started = Instant::now();
        let result = runner.run(task.clone()).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                debug!(task = name, elapsed, "task finished");
                crate::metrics::record_background_job(name, "success", elapsed);
            }
            Err(e) if e.requires_reauthorization() => {
                warn!(task = ?task, "task stopped, account needs reconnecting: {}", e);
                crate::metrics::record_background_job(name, "reauthorization", elapsed);
            }
            Err(e) => {
                error!(task = ?task, "task failed: {}", e);
                crate::metrics::record_background_job(name, "failure", elapsed);
            }
        }
    }
}

/// Job scheduler for periodic background work
pub struct JobScheduler {
    context: Arc<AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        tokio::spawn(Self::periodic_sync_job(Arc::clone(&self)));
        tokio::spawn(Self::subscription_renewal_job(Arc::clone(&self)));
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Full sync of every active account (configurable interval)
    async fn periodic_sync_job(scheduler: Arc<Self>) {
        let minutes = scheduler.context.config.sync.interval_minutes.max(1);
        let mut interval = interval(Duration::from_secs(minutes * 60));

        loop {
            interval.tick().await;
            info!("Running periodic sync");

            match tasks::enqueue_periodic_syncs(&scheduler.context).await {
                Ok(count) => info!("Enqueued sync for {} accounts", count),
                Err(e) => error!("Failed to enqueue periodic syncs: {}", e),
            }
        }
    }

    /// Renew push subscriptions nearing expiry (runs every hour)
    async fn subscription_renewal_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(3600));

        loop {
            interval.tick().await;

            if let Err(e) = scheduler
                .context
                .dispatcher
                .dispatch(Task::RenewSubscriptions)
                .await
            {
                error!("Failed to enqueue subscription renewal: {}", e);
            }
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;

            match tasks::health_check(&scheduler.context).await {
                Ok(_) => {
                    // Silent success - health is good
                }
                Err(e) => error!("Health check failed: {}", e),
            }
        }
    }
}
