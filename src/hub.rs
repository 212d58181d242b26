use std::{collections::HashMap, sync::Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{ChatMessage, IceCandidate, MediaPermission, SessionId, SignalRecord, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Left,
    Expired,
}

/// Everything pushed to the live subscribers of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { user_id: UserId, name: String },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { user_id: UserId, reason: LeaveReason },
    #[serde(rename_all = "camelCase")]
    MediaChanged { user_id: UserId, permission: MediaPermission },
    Message(ChatMessage),
    Offer { to: UserId, offer: SignalRecord },
    Answer { to: UserId, answer: SignalRecord },
    IceCandidate {
        to: UserId,
        from: UserId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    PeerConnected { user_id: UserId },
    SessionEnded,
}

impl RoomEvent {
    /// The only user an event is meant for, if it is not for the whole room.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            RoomEvent::Offer { to, .. }
            | RoomEvent::Answer { to, .. }
            | RoomEvent::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn is_for(&self, user_id: &str) -> bool {
        self.recipient().is_none_or(|to| to == user_id)
    }
}

/// One broadcast channel per live session.
pub struct Hub {
    capacity: usize,
    channels: Mutex<HashMap<SessionId, broadcast::Sender<RoomEvent>>>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<RoomEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(session_id.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns how many subscribers were listening.
    pub fn publish(&self, session_id: &str, event: RoomEvent) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(session_id)
            .and_then(|tx| tx.send(event).ok())
            .unwrap_or(0)
    }

    /// Drops the channel so subscribers see it close after draining.
    pub fn close(&self, session_id: &str) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }
}
