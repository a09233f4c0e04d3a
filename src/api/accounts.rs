/// Connected account endpoints
use crate::{
    account::{AccountView, ConnectCalDavRequest, ConnectOAuthRequest, SetCalendarEnabledRequest},
    auth::AuthUser,
    context::AppContext,
    db::models::{Calendar, ConnectedAccount},
    error::CalResult,
    providers::{CreatedEvent, EventDraft},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api/accounts", get(list_accounts))
        .route("/api/accounts/oauth", post(connect_oauth))
        .route("/api/accounts/caldav", post(connect_caldav))
        .route("/api/accounts/:account_id", delete(disconnect))
        .route("/api/accounts/:account_id/sync", post(trigger_sync))
        .route("/api/calendars/:calendar_id/enabled", put(set_calendar_enabled))
        .route("/api/calendars/:calendar_id/events", post(create_event))
        .route("/api/user", delete(delete_user_data))
}

async fn list_accounts(
    State(ctx): State<AppContext>,
    user: AuthUser,
) -> CalResult<Json<Vec<AccountView>>> {
    Ok(Json(ctx.accounts.list_accounts(&user.user_id).await?))
}

async fn connect_oauth(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Json(request): Json<ConnectOAuthRequest>,
) -> CalResult<(StatusCode, Json<ConnectedAccount>)> {
    let account = ctx.accounts.connect_oauth(&user.user_id, &request).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn connect_caldav(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Json(request): Json<ConnectCalDavRequest>,
) -> CalResult<(StatusCode, Json<ConnectedAccount>)> {
    let account = ctx.accounts.connect_caldav(&user.user_id, &request).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn disconnect(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Path(account_id): Path<String>,
) -> CalResult<StatusCode> {
    ctx.accounts.disconnect(&user.user_id, &account_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn trigger_sync(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Path(account_id): Path<String>,
) -> CalResult<(StatusCode, Json<Value>)> {
    ctx.accounts.trigger_sync(&user.user_id, &account_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "account_id": account_id, "status": "queued" })),
    ))
}

async fn set_calendar_enabled(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Path(calendar_id): Path<String>,
    Json(request): Json<SetCalendarEnabledRequest>,
) -> CalResult<Json<Calendar>> {
    let calendar = ctx
        .accounts
        .set_calendar_enabled(&user.user_id, &calendar_id, request.enabled)
        .await?;
    Ok(Json(calendar))
}

async fn create_event(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Path(calendar_id): Path<String>,
    Json(draft): Json<EventDraft>,
) -> CalResult<(StatusCode, Json<CreatedEvent>)> {
    let created = ctx
        .accounts
        .create_event(&user.user_id, &calendar_id, &draft)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_user_data(State(ctx): State<AppContext>, user: AuthUser) -> CalResult<StatusCode> {
    ctx.accounts.delete_user_data(&user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
