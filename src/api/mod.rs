/// API routes and handlers
pub mod accounts;
pub mod conflicts;
pub mod events;
pub mod health;
pub mod webhooks;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(accounts::routes())
        .merge(events::routes())
        .merge(conflicts::routes())
        .merge(webhooks::routes())
}
