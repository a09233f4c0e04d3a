/// Event listing
use crate::{
    account::EventRange, auth::AuthUser, context::AppContext, db::models::Event,
    error::CalResult,
};
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};

pub fn routes() -> Router<AppContext> {
    Router::new().route("/api/events", get(list_events))
}

async fn list_events(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Query(range): Query<EventRange>,
) -> CalResult<Json<Vec<Event>>> {
    let events = ctx
        .accounts
        .list_events(&user.user_id, range.from, range.to)
        .await?;
    Ok(Json(events))
}
