use std::sync::Arc;

use axum::{debug_handler, extract::State, http::StatusCode, Json};
use serde::Deserialize;

use crate::{live::Live, model::{Identity, Room}, AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewSessionQuery {
    #[serde(default)]
    session_id: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn host_session(
    State(live): State<Arc<Live>>,
    identity: Identity,
    query: Option<Json<NewSessionQuery>>,
) -> AppResult<(StatusCode, Json<Room>)> {
    let Json(NewSessionQuery { session_id }) = query.unwrap_or_default();
    let room = live.host(session_id, &identity).await?;

    Ok((StatusCode::CREATED, Json(room)))
}
