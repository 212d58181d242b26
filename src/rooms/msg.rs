use std::sync::Arc;

use axum::{debug_handler, extract::{Path, Query, State}, http::StatusCode, Json};
use serde::Deserialize;

use crate::{live::Live, model::{ChatMessage, Identity}, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct SendMessageQuery {
    text: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<usize>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn send(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
    Json(SendMessageQuery { text }): Json<SendMessageQuery>,
) -> AppResult<(StatusCode, Json<ChatMessage>)> {
    let message = live.send_message(&session_id, &identity, &text).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Latest messages, oldest first.
#[debug_handler(state = AppState)]
pub(crate) async fn history(
    Path(session_id): Path<String>,
    Query(HistoryQuery { limit }): Query<HistoryQuery>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<Json<Vec<ChatMessage>>> {
    Ok(Json(live.messages(&session_id, &identity, limit).await?))
}
