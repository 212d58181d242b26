//! Backends for the realtime record space: rooms, their participants, signaling
//! records and chat history. The live service only talks to [`RoomStore`], so
//! the backend is picked at startup and tests can swap in [`MemoryStore`].

mod memory;
mod sqlite;

use async_trait::async_trait;

use crate::model::{ChatMessage, Room, SignalRecord};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("room {0} already exists")]
    RoomExists(String),
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("room {0} has ended")]
    RoomEnded(String),
    #[error("room is full ({max} participants)")]
    RoomFull { max: usize },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Inserts `room` only if nothing is stored under its id yet, ended rooms included.
    async fn create_room(&self, room: &Room) -> StoreResult<()>;

    async fn room(&self, session_id: &str) -> StoreResult<Option<Room>>;

    /// Adds or renames a participant of an active room in one step. A newcomer
    /// is refused once the room holds `max` participants.
    async fn join_room(&self, session_id: &str, user_id: &str, name: &str, max: usize) -> StoreResult<()>;

    /// Every room that has not been ended.
    async fn active_rooms(&self) -> StoreResult<Vec<Room>>;

    async fn remove_participant(&self, session_id: &str, user_id: &str) -> StoreResult<bool>;

    /// Marks the room inactive. Returns false if it was already ended or never existed.
    async fn end_room(&self, session_id: &str) -> StoreResult<bool>;

    /// Stores the offer under `offer.user_id`, replacing an earlier one.
    async fn put_offer(&self, session_id: &str, offer: &SignalRecord) -> StoreResult<()>;

    async fn offers(&self, session_id: &str) -> StoreResult<Vec<SignalRecord>>;

    /// Stores the host's answer for participant `to`.
    async fn put_answer(&self, session_id: &str, to: &str, answer: &SignalRecord) -> StoreResult<()>;

    async fn answer(&self, session_id: &str, to: &str) -> StoreResult<Option<SignalRecord>>;

    /// Drops the offer and answer kept for one participant.
    async fn clear_signals(&self, session_id: &str, user_id: &str) -> StoreResult<()>;

    async fn append_message(&self, session_id: &str, message: &ChatMessage) -> StoreResult<()>;

    /// The latest `limit` messages, oldest first.
    async fn messages(&self, session_id: &str, limit: usize) -> StoreResult<Vec<ChatMessage>>;
}
