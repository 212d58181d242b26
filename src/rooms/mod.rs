mod msg;
mod new;
mod room;
mod signal;
mod ws;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(new::host_session))
        .route("/{session_id}", get(room::room).delete(room::end))
        .route("/{session_id}/join", post(room::join))
        .route("/{session_id}/leave", post(room::leave))
        .route("/{session_id}/heartbeat", post(room::heartbeat))
        .route("/{session_id}/media", post(room::media))
        .route("/{session_id}/messages", get(msg::history).post(msg::send))
        .route("/{session_id}/offer", post(signal::offer))
        .route("/{session_id}/offers", get(signal::offers))
        .route("/{session_id}/answer", get(signal::answer))
        .route("/{session_id}/answer/{user_id}", post(signal::publish_answer))
        .route("/{session_id}/ice/{peer}", get(signal::take_ice).post(signal::add_ice))
        .route("/{session_id}/connected/{peer}", post(signal::connected))
        .route("/{session_id}/negotiation/{peer}", get(signal::negotiation))
        .route("/{session_id}/ws", get(ws::room_ws))
}
