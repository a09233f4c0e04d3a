/// Health and metrics endpoints
///
/// `/health` reports database and cache reachability; `/metrics` serves the
/// Prometheus text format.
use crate::{context::AppContext, db, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Health status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// "healthy" or "unhealthy"
    pub status: String,
    pub version: String,
    pub checks: Vec<ComponentHealth>,
}

/// Health status of individual component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result<E: std::fmt::Display>(name: &str, started: Instant, result: Result<(), E>) -> Self {
        let response_time_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => Self {
                name: name.to_string(),
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => {
                tracing::warn!(component = name, error = %e, "health check failed");
                Self {
                    name: name.to_string(),
                    status: "unhealthy".to_string(),
                    response_time_ms,
                    // Component names only; details stay in the logs
                    error: Some(format!("{} unreachable", name)),
                }
            }
        }
    }
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
}

async fn health(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let started = Instant::now();
    let database = ComponentHealth::from_result(
        "database",
        started,
        db::test_connection(&ctx.db).await,
    );

    let started = Instant::now();
    let cache = ComponentHealth::from_result("cache", started, ctx.cache.ping().await);

    let checks = vec![database, cache];
    let healthy = checks.iter().all(|c| c.status == "healthy");

    let status = HealthStatus {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: ctx.config.service.version.clone(),
        checks,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(status))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}
