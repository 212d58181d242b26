use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{ChatMessage, Room, SignalRecord, UserId};

use super::{RoomStore, StoreError, StoreResult};

struct Entry {
    room: Room,
    offers: BTreeMap<UserId, SignalRecord>,
    answers: BTreeMap<UserId, SignalRecord>,
    messages: Vec<ChatMessage>,
}

#[derive(Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn entry_mut<'a>(
    rooms: &'a mut HashMap<String, Entry>,
    session_id: &str,
) -> StoreResult<&'a mut Entry> {
    rooms
        .get_mut(session_id)
        .ok_or_else(|| StoreError::RoomNotFound(session_id.to_owned()))
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn create_room(&self, room: &Room) -> StoreResult<()> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room.session_id) {
            return Err(StoreError::RoomExists(room.session_id.clone()));
        }

        rooms.insert(
            room.session_id.clone(),
            Entry {
                room: room.clone(),
                offers: BTreeMap::new(),
                answers: BTreeMap::new(),
                messages: Vec::new(),
            },
        );
        Ok(())
    }

    async fn room(&self, session_id: &str) -> StoreResult<Option<Room>> {
        Ok(self
            .rooms
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.room.clone()))
    }

    async fn join_room(&self, session_id: &str, user_id: &str, name: &str, max: usize) -> StoreResult<()> {
        let mut rooms = self.rooms.write().await;
        let room = &mut entry_mut(&mut rooms, session_id)?.room;

        if !room.active {
            return Err(StoreError::RoomEnded(session_id.to_owned()));
        }
        if !room.has_participant(user_id) && room.participants.len() >= max {
            return Err(StoreError::RoomFull { max });
        }

        room.participants.insert(user_id.to_owned(), name.to_owned());
        Ok(())
    }

    async fn active_rooms(&self) -> StoreResult<Vec<Room>> {
        Ok(self
            .rooms
            .read()
            .await
            .values()
            .filter(|entry| entry.room.active)
            .map(|entry| entry.room.clone())
            .collect())
    }

    async fn remove_participant(&self, session_id: &str, user_id: &str) -> StoreResult<bool> {
        let mut rooms = self.rooms.write().await;
        Ok(entry_mut(&mut rooms, session_id)?
            .room
            .participants
            .remove(user_id)
            .is_some())
    }

    async fn end_room(&self, session_id: &str) -> StoreResult<bool> {
        let mut rooms = self.rooms.write().await;
        let Some(entry) = rooms.get_mut(session_id) else {
            return Ok(false);
        };

        let was_active = entry.room.active;
        entry.room.active = false;
        Ok(was_active)
    }

    async fn put_offer(&self, session_id: &str, offer: &SignalRecord) -> StoreResult<()> {
        let mut rooms = self.rooms.write().await;
        entry_mut(&mut rooms, session_id)?
            .offers
            .insert(offer.user_id.clone(), offer.clone());
        Ok(())
    }

    async fn offers(&self, session_id: &str) -> StoreResult<Vec<SignalRecord>> {
        Ok(self
            .rooms
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.offers.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_answer(&self, session_id: &str, to: &str, answer: &SignalRecord) -> StoreResult<()> {
        let mut rooms = self.rooms.write().await;
        entry_mut(&mut rooms, session_id)?
            .answers
            .insert(to.to_owned(), answer.clone());
        Ok(())
    }

    async fn answer(&self, session_id: &str, to: &str) -> StoreResult<Option<SignalRecord>> {
        Ok(self
            .rooms
            .read()
            .await
            .get(session_id)
            .and_then(|entry| entry.answers.get(to).cloned()))
    }

    async fn clear_signals(&self, session_id: &str, user_id: &str) -> StoreResult<()> {
        let mut rooms = self.rooms.write().await;
        if let Some(entry) = rooms.get_mut(session_id) {
            entry.offers.remove(user_id);
            entry.answers.remove(user_id);
        }
        Ok(())
    }

    async fn append_message(&self, session_id: &str, message: &ChatMessage) -> StoreResult<()> {
        let mut rooms = self.rooms.write().await;
        let messages = &mut entry_mut(&mut rooms, session_id)?.messages;

        let at = messages.partition_point(|m| m.timestamp <= message.timestamp);
        messages.insert(at, message.clone());
        Ok(())
    }

    async fn messages(&self, session_id: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let rooms = self.rooms.read().await;
        let Some(entry) = rooms.get(session_id) else {
            return Ok(Vec::new());
        };

        let skip = entry.messages.len().saturating_sub(limit);
        Ok(entry.messages[skip..].to_vec())
    }
}
