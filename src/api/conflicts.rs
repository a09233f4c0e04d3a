/// Conflict and free-slot endpoints
use crate::{
    auth::AuthUser,
    conflicts::{FreeSlot, FreeSlotRequest},
    context::AppContext,
    db::models::{ConflictFlag, ConflictStatus},
    error::CalResult,
};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ListConflictsParams {
    pub status: Option<ConflictStatus>,
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api/conflicts", get(list_conflicts))
        .route("/api/conflicts/:flag_id/acknowledge", post(acknowledge))
        .route("/api/conflicts/:flag_id/resolve", post(resolve))
        .route("/api/conflicts/:flag_id/reopen", post(reopen))
        .route("/api/free-slots", post(free_slots))
}

async fn list_conflicts(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Query(params): Query<ListConflictsParams>,
) -> CalResult<Json<Vec<ConflictFlag>>> {
    Ok(Json(ctx.detector.list(&user.user_id, params.status).await?))
}

async fn acknowledge(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Path(flag_id): Path<String>,
) -> CalResult<Json<ConflictFlag>> {
    Ok(Json(ctx.detector.acknowledge(&user.user_id, &flag_id).await?))
}

async fn resolve(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Path(flag_id): Path<String>,
) -> CalResult<Json<ConflictFlag>> {
    Ok(Json(ctx.detector.resolve(&user.user_id, &flag_id).await?))
}

async fn reopen(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Path(flag_id): Path<String>,
) -> CalResult<Json<ConflictFlag>> {
    Ok(Json(ctx.detector.reopen(&user.user_id, &flag_id).await?))
}

async fn free_slots(
    State(ctx): State<AppContext>,
    user: AuthUser,
    Json(request): Json<FreeSlotRequest>,
) -> CalResult<Json<Vec<FreeSlot>>> {
    Ok(Json(ctx.detector.free_slots(&user.user_id, &request).await?))
}
