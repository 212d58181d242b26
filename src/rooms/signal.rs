use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::{
    live::{Live, NegotiationView},
    model::{IceCandidate, Identity, SessionDescription, SignalRecord},
    AppResult, AppState,
};

#[debug_handler(state = AppState)]
pub(crate) async fn offer(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
    Json(description): Json<SessionDescription>,
) -> AppResult<(StatusCode, Json<SignalRecord>)> {
    let offer = live.publish_offer(&session_id, &identity, description).await?;
    Ok((StatusCode::CREATED, Json(offer)))
}

#[debug_handler(state = AppState)]
pub(crate) async fn offers(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<Json<Vec<SignalRecord>>> {
    Ok(Json(live.offers(&session_id, &identity).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn publish_answer(
    Path((session_id, user_id)): Path<(String, String)>,
    State(live): State<Arc<Live>>,
    identity: Identity,
    Json(description): Json<SessionDescription>,
) -> AppResult<(StatusCode, Json<SignalRecord>)> {
    let answer = live
        .publish_answer(&session_id, &identity, &user_id, description)
        .await?;
    Ok((StatusCode::CREATED, Json(answer)))
}

/// 404 until the host has answered the caller's offer.
#[debug_handler(state = AppState)]
pub(crate) async fn answer(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<Response> {
    Ok(match live.answer(&session_id, &identity).await? {
        Some(answer) => Json(answer).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

#[debug_handler(state = AppState)]
pub(crate) async fn add_ice(
    Path((session_id, peer)): Path<(String, String)>,
    State(live): State<Arc<Live>>,
    identity: Identity,
    Json(candidate): Json<IceCandidate>,
) -> AppResult<StatusCode> {
    live.add_ice_candidate(&session_id, &identity, &peer, candidate)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[debug_handler(state = AppState)]
pub(crate) async fn take_ice(
    Path((session_id, peer)): Path<(String, String)>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<Json<Vec<IceCandidate>>> {
    Ok(Json(
        live.take_ice_candidates(&session_id, &identity, &peer)
            .await?,
    ))
}

#[debug_handler(state = AppState)]
pub(crate) async fn connected(
    Path((session_id, peer)): Path<(String, String)>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<StatusCode> {
    live.mark_connected(&session_id, &identity, &peer).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = AppState)]
pub(crate) async fn negotiation(
    Path((session_id, peer)): Path<(String, String)>,
    State(live): State<Arc<Live>>,
    identity: Identity,
) -> AppResult<Json<NegotiationView>> {
    Ok(Json(live.negotiation(&session_id, &identity, &peer).await?))
}
