use std::sync::Arc;

use axum::{debug_handler, extract::{Path, State}, http::StatusCode, Json};
use serde::Deserialize;

use crate::{live::{Live, RoomView}, model::{Identity, MediaPermission}, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct MediaQuery {
    permission: MediaPermission,
}

#[debug_handler(state = AppState)]
pub(crate) async fn room(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<Json<RoomView>> {
    Ok(Json(live.room(&session_id, &identity).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn join(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<Json<RoomView>> {
    Ok(Json(live.join(&session_id, &identity).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn leave(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<StatusCode> {
    live.leave(&session_id, &identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = AppState)]
pub(crate) async fn end(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<StatusCode> {
    live.end(&session_id, &identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = AppState)]
pub(crate) async fn heartbeat(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<StatusCode> {
    live.heartbeat(&session_id, &identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = AppState)]
pub(crate) async fn media(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
    Json(MediaQuery { permission }): Json<MediaQuery>,
) -> AppResult<StatusCode> {
    live.report_media(&session_id, &identity, permission).await?;
    Ok(StatusCode::NO_CONTENT)
}
