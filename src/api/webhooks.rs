/// Provider-facing webhook endpoints
///
/// Providers give us seconds to answer, so handlers acknowledge right away
/// and resolve the notification on a detached task.
use crate::{
    context::AppContext,
    webhooks::{GoogleNotification, MicrosoftNotificationBatch},
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
pub struct ValidationParams {
    #[serde(rename = "validationToken")]
    pub validation_token: Option<String>,
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/webhooks/google", post(google_notification))
        .route(
            "/webhooks/microsoft",
            post(microsoft_notification).get(microsoft_validation),
        )
}

async fn google_notification(State(ctx): State<AppContext>, headers: HeaderMap) -> StatusCode {
    let Some(notification) = GoogleNotification::from_headers(&headers) else {
        return StatusCode::BAD_REQUEST;
    };

    let ingress = ctx.webhooks.clone();
    tokio::spawn(async move {
        if let Err(e) = ingress.handle_google(&notification).await {
            error!(channel_id = %notification.channel_id, "google notification failed: {}", e);
        }
    });

    StatusCode::OK
}

/// Echo the subscription validation token verbatim
fn echo_token(token: String) -> Response {
    debug!("answering microsoft subscription validation");
    ([(header::CONTENT_TYPE, "text/plain")], token).into_response()
}

async fn microsoft_validation(Query(params): Query<ValidationParams>) -> Response {
    match params.validation_token {
        Some(token) => echo_token(token),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn microsoft_notification(
    State(ctx): State<AppContext>,
    Query(params): Query<ValidationParams>,
    body: Bytes,
) -> Response {
    if let Some(token) = params.validation_token {
        return echo_token(token);
    }

    let batch: MicrosoftNotificationBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            debug!("unparseable microsoft notification: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let ingress = ctx.webhooks.clone();
    tokio::spawn(async move {
        if let Err(e) = ingress.handle_microsoft(&batch).await {
            error!("microsoft notification failed: {}", e);
        }
    });

    StatusCode::ACCEPTED.into_response()
}
