/// HTTP server setup and routing
use crate::{
    context::AppContext,
    error::{CalError, CalResult},
};
use axum::{
    http::{header, Method, StatusCode},
    response::Json,
    Router,
};
use serde_json::json;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Build the main application router
/// Returns Router<()> because state is already provided
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .merge(crate::api::routes())
        .with_state(ctx)
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .fallback(not_found)
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Start the HTTP server
pub async fn serve(ctx: AppContext) -> CalResult<()> {
    let addr = format!("{}:{}", ctx.config.service.hostname, ctx.config.service.port);

    info!("calsync listening on {}", addr);
    info!("   Webhook base URL: {}", ctx.config.service.public_url);

    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CalError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| CalError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::issue_token;
    use crate::db::models::{PushSubscription, ProviderKind};
    use crate::jobs::Task;
    use crate::providers::{ProviderRegistry, SyncCursor};
    use crate::store::{EventBatch, SqliteStore, Store};
    use crate::testing::{normalized_event, seed_account, FakeProvider};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn context() -> AppContext {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider::new(ProviderKind::Google)));
        AppContext::for_tests(registry).await
    }

    fn bearer(ctx: &AppContext, user_id: &str) -> String {
        format!(
            "Bearer {}",
            issue_token(user_id, &ctx.config.authentication.jwt_secret, 3600)
        )
    }

    async fn send(ctx: &AppContext, request: Request<Body>) -> (StatusCode, String) {
        let response = build_router(ctx.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn get(uri: &str, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, auth: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", auth)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_fallback() {
        let ctx = context().await;

        let (status, body) = send(&ctx, get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"healthy\""));

        let (status, body) = send(&ctx, get("/nope", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("NotFound"));
    }

    #[tokio::test]
    async fn test_api_requires_valid_token() {
        let ctx = context().await;

        let (status, body) = send(&ctx, get("/api/conflicts", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("AuthenticationRequired"));

        let forged = format!("Bearer {}", issue_token("user-1", "another-secret-of-sufficient-length", 60));
        let (status, _) = send(&ctx, get("/api/conflicts", Some(&forged))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let auth = bearer(&ctx, "user-1");
        let (status, body) = send(&ctx, get("/api/conflicts", Some(&auth))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn test_microsoft_validation_is_echoed_as_plain_text() {
        let ctx = context().await;

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/microsoft?validationToken=abc%20123")
            .body(Body::empty())
            .unwrap();
        let response = build_router(ctx.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abc 123");

        let (status, body) = send(&ctx, get("/webhooks/microsoft?validationToken=xyz", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "xyz");
    }

    #[tokio::test]
    async fn test_google_webhook_acknowledges_then_enqueues() {
        let ctx = context().await;
        let store = SqliteStore::new(ctx.db.clone());
        let (account, calendar) = seed_account(&store, "user-1").await;
        store
            .save_push_subscription(&PushSubscription {
                id: "sub-1".to_string(),
                account_id: account.id.clone(),
                calendar_id: calendar.id.clone(),
                provider: ProviderKind::Google,
                channel_id: "chan-1".to_string(),
                resource_id: None,
                client_state: "secret".to_string(),
                expires_at: Utc::now() + chrono::Duration::days(1),
            })
            .await
            .unwrap();

        let mut queue = ctx.task_queue_for_tests();

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/google")
            .header("x-goog-channel-id", "chan-1")
            .header("x-goog-resource-state", "exists")
            .header("x-goog-channel-token", "secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&ctx, request).await;
        assert_eq!(status, StatusCode::OK);

        let task = tokio::time::timeout(std::time::Duration::from_secs(5), queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            task,
            Task::DeltaSync {
                account_id: account.id,
                calendar_id: Some(calendar.id),
            }
        );

        // Missing headers
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/google")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&ctx, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_manual_sync_returns_429_when_budget_is_spent() {
        let ctx = context().await;
        let store = SqliteStore::new(ctx.db.clone());
        let (account, _) = seed_account(&store, "user-1").await;
        let auth = bearer(&ctx, "user-1");
        let uri = format!("/api/accounts/{}/sync", account.id);

        let budget = ctx.config.rate_limit.manual_syncs_per_hour;
        for _ in 0..budget {
            let (status, _) = send(&ctx, post_json(&uri, &auth, serde_json::json!({}))).await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }
        let (status, body) = send(&ctx, post_json(&uri, &auth, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body.contains("RateLimitExceeded"));

        // Someone else's account
        let other = bearer(&ctx, "user-2");
        let (status, _) = send(&ctx, post_json(&uri, &other, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_conflicts_and_free_slots_over_http() {
        let ctx = context().await;
        let store = SqliteStore::new(ctx.db.clone());
        let (account, calendar) = seed_account(&store, "user-1").await;
        let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2030, 3, 4, h, m, 0).unwrap();
        store
            .apply_event_batch(&EventBatch {
                user_id: "user-1".to_string(),
                account_id: account.id.clone(),
                calendar_id: calendar.id.clone(),
                provider: ProviderKind::Google,
                upserts: vec![
                    normalized_event("a", at(9, 0), at(10, 0)),
                    normalized_event("b", at(9, 30), at(10, 30)),
                ],
                removals: vec![],
                snapshot: None,
                next_cursor: Some(SyncCursor::Google {
                    token: "t".to_string(),
                }),
            })
            .await
            .unwrap();
        ctx.detector.scan("user-1").await.unwrap();

        let auth = bearer(&ctx, "user-1");
        let (status, body) = send(&ctx, get("/api/conflicts?status=active", Some(&auth))).await;
        assert_eq!(status, StatusCode::OK);
        let flags: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0]["overlap_minutes"], 30);
        let flag_id = flags[0]["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &ctx,
            post_json(
                &format!("/api/conflicts/{}/acknowledge", flag_id),
                &auth,
                serde_json::json!({}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"acknowledged\""));

        let (status, body) = send(
            &ctx,
            post_json(
                "/api/free-slots",
                &auth,
                serde_json::json!({
                    "duration_minutes": 30,
                    "window_start": "2030-03-04T00:00:00Z",
                    "window_end": "2030-03-04T23:00:00Z"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let slots: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        // 10:30-17:00 is the only gap
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0]["start"], "2030-03-04T10:30:00Z");

        let (status, _) = send(
            &ctx,
            post_json(
                "/api/free-slots",
                &auth,
                serde_json::json!({
                    "duration_minutes": 1,
                    "window_start": "2030-03-04T00:00:00Z",
                    "window_end": "2030-03-04T23:00:00Z"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
