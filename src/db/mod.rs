/// Database layer for calsync
///
/// Manages the SQLite connection pool and embedded migrations, and defines
/// the entity models shared by the store, sync engine and API.

pub mod models;

use crate::config::StorageConfig;
use crate::error::CalResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Create a SQLite connection pool
pub async fn create_pool(config: &StorageConfig) -> CalResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let in_memory = config.database_url.contains(":memory:");

    if !in_memory {
        if let Some(parent) = options.get_filename().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let options = if in_memory {
        options
    } else {
        options.journal_mode(SqliteJournalMode::Wal)
    };

    // Every in-memory connection is its own database, so tests get exactly one
    let max_connections = if in_memory { 1 } else { config.max_connections };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Run migrations for a database
/// Migrations are embedded at compile time from ./migrations directory
pub async fn run_migrations(pool: &SqlitePool) -> CalResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Test database connection
pub async fn test_connection(pool: &SqlitePool) -> CalResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;

    Ok(())
}

/// Fresh in-memory database with migrations applied
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = create_pool(&StorageConfig {
        database_url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
