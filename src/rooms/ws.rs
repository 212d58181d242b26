use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{ws::{Message, WebSocket}, Path, State, WebSocketUpgrade},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast::{self, error::RecvError}, mpsc};
use tracing::{debug, info, warn};

use crate::{
    hub::RoomEvent,
    live::{Live, LiveResult, RoomView},
    model::{IceCandidate, IceServer, Identity, MediaPermission, SdpType, SessionDescription, UserId},
    AppResult, AppState,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Heartbeat,
    Chat { text: String },
    Offer { sdp: String },
    Answer { to: UserId, sdp: String },
    IceCandidate { to: UserId, candidate: IceCandidate },
    Connected { peer: UserId },
    Media { permission: MediaPermission },
    Leave,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply<'a> {
    #[serde(rename_all = "camelCase")]
    Welcome {
        room: &'a RoomView,
        ice_servers: &'a [IceServer],
    },
    Error { reason: String },
}

enum Flow {
    Continue,
    Leave,
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    Path(session_id): Path<String>,
    State(live): State<Arc<Live>>,
    identity: Identity,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let (view, events) = live.subscribe(&session_id, &identity).await?;

    Ok(ws.on_upgrade(move |socket| serve(socket, live, session_id, identity, view, events)))
}

async fn serve(
    socket: WebSocket,
    live: Arc<Live>,
    session_id: String,
    identity: Identity,
    view: RoomView,
    mut events: broadcast::Receiver<RoomEvent>,
) {
    info!(session_id = %session_id, user_id = %identity.user_id, "live connection opened");

    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(16);

    if let Some(welcome) = encode(&Reply::Welcome {
        room: &view,
        ice_servers: live.ice_servers(),
    }) {
        let _ = reply_tx.send(welcome).await;
    }

    let user_id = identity.user_id.clone();
    let mut forward_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(text) => text,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) if event.is_for(&user_id) => match encode(&event) {
                        Some(text) => text,
                        None => continue,
                    },
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(user_id = %user_id, skipped, "live connection lagged, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }

        let _ = sender.close().await;
    });

    let recv_live = Arc::clone(&live);
    let recv_session_id = session_id.clone();
    let recv_identity = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        let (live, session_id, identity) = (recv_live, recv_session_id, recv_identity);

        while let Some(Ok(msg)) = receiver.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            // Any frame counts as a sign of life.
            let _ = live.heartbeat(&session_id, &identity).await;

            let outcome = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(msg) => dispatch(&live, &session_id, &identity, msg)
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(format!("unreadable message: {err}")),
            };

            match outcome {
                Ok(Flow::Continue) => {}
                Ok(Flow::Leave) => break,
                Err(reason) => {
                    debug!(session_id = %session_id, user_id = %identity.user_id, %reason, "rejected live message");
                    if let Some(text) = encode(&Reply::Error { reason }) {
                        if reply_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut forward_task => recv_task.abort(),
        _ = &mut recv_task => forward_task.abort(),
    };

    info!(session_id = %session_id, user_id = %identity.user_id, "live connection closed");
}

async fn dispatch(live: &Live, session_id: &str, who: &Identity, msg: ClientMessage) -> LiveResult<Flow> {
    match msg {
        ClientMessage::Heartbeat => live.heartbeat(session_id, who).await?,
        ClientMessage::Chat { text } => {
            live.send_message(session_id, who, &text).await?;
        }
        ClientMessage::Offer { sdp } => {
            let description = SessionDescription {
                kind: SdpType::Offer,
                sdp,
            };
            live.publish_offer(session_id, who, description).await?;
        }
        ClientMessage::Answer { to, sdp } => {
            let description = SessionDescription {
                kind: SdpType::Answer,
                sdp,
            };
            live.publish_answer(session_id, who, &to, description).await?;
        }
        ClientMessage::IceCandidate { to, candidate } => {
            live.add_ice_candidate(session_id, who, &to, candidate).await?
        }
        ClientMessage::Connected { peer } => live.mark_connected(session_id, who, &peer).await?,
        ClientMessage::Media { permission } => live.report_media(session_id, who, permission).await?,
        ClientMessage::Leave => {
            live.leave(session_id, who).await?;
            return Ok(Flow::Leave);
        }
    }

    Ok(Flow::Continue)
}

fn encode<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value)
        .map_err(|err| warn!(%err, "failed to encode live message"))
        .ok()
}
