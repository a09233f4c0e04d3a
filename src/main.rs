/// calsync - multi-provider calendar synchronization
///
/// Mirrors Google, Microsoft and CalDAV calendars into one local store,
/// keeps them fresh through push notifications and periodic syncs, and flags
/// overlapping events across every connected account.

mod account;
mod api;
mod auth;
mod cache;
mod conflicts;
mod config;
mod context;
mod db;
mod error;
mod jobs;
mod metrics;
mod normalize;
mod providers;
mod rate_limit;
mod server;
mod store;
mod sync;
#[cfg(test)]
mod testing;
mod vault;
mod webhooks;

use config::ServerConfig;
use context::AppContext;
use error::CalResult;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> CalResult<()> {
    // Load configuration
    let config = ServerConfig::from_env()?;

    // Initialize logging
    init_tracing(&config.logging.format);

    info!("calsync v{}", env!("CARGO_PKG_VERSION"));

    // Create application context
    let ctx = AppContext::new(config).await?;
    let ctx = Arc::new(ctx);

    // Start task workers and periodic jobs
    let workers = ctx.start_workers()?;
    info!("Started {} sync workers", workers.len());

    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    // Start server
    server::serve((*ctx).clone()).await?;

    Ok(())
}

fn init_tracing(format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "calsync=debug,tower_http=debug".into());

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
