use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::model::{ChatMessage, Room, SdpType, SessionDescription, SignalRecord};

use super::{RoomStore, StoreError, StoreResult};

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS rooms (
        session_id TEXT PRIMARY KEY,
        host_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        active INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS participants (
        session_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        PRIMARY KEY (session_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS offers (
        session_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        type TEXT NOT NULL,
        sdp TEXT NOT NULL,
        user_name TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (session_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS answers (
        session_id TEXT NOT NULL,
        to_user_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        type TEXT NOT NULL,
        sdp TEXT NOT NULL,
        user_name TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (session_id, to_user_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        session_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        user_name TEXT NOT NULL,
        text TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS messages_by_session ON messages (session_id, timestamp, seq)",
];

type SignalRow = (String, String, String, String, i64);

/// Room records persisted in SQLite so ended sessions and chat history survive restarts.
#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

impl SqliteStore {
    /// Wraps `db_pool` and creates the tables if they are missing.
    pub async fn new(db_pool: SqlitePool) -> StoreResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&db_pool).await?;
        }

        Ok(Self { db_pool })
    }
}

fn signal_from_row((kind, sdp, user_id, user_name, timestamp): SignalRow) -> StoreResult<SignalRecord> {
    Ok(SignalRecord {
        description: SessionDescription {
            kind: kind.parse::<SdpType>().map_err(StoreError::Corrupt)?,
            sdp,
        },
        user_id,
        user_name,
        timestamp,
    })
}

#[async_trait]
impl RoomStore for SqliteStore {
    async fn create_room(&self, room: &Room) -> StoreResult<()> {
        let mut tx = self.db_pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO rooms (session_id,host_id,created_at,active) VALUES (?,?,?,?)
             ON CONFLICT(session_id) DO NOTHING",
        )
        .bind(&room.session_id)
        .bind(&room.host_id)
        .bind(room.created_at)
        .bind(room.active)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::RoomExists(room.session_id.clone()));
        }

        for (user_id, name) in &room.participants {
            sqlx::query("INSERT INTO participants (session_id,user_id,name) VALUES (?,?,?)")
                .bind(&room.session_id)
                .bind(user_id)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn room(&self, session_id: &str) -> StoreResult<Option<Room>> {
        let Some((host_id, created_at, active)): Option<(String, i64, bool)> =
            sqlx::query_as("SELECT host_id,created_at,active FROM rooms WHERE session_id=?")
                .bind(session_id)
                .fetch_optional(&self.db_pool)
                .await?
        else {
            return Ok(None);
        };

        let participants: Vec<(String, String)> =
            sqlx::query_as("SELECT user_id,name FROM participants WHERE session_id=?")
                .bind(session_id)
                .fetch_all(&self.db_pool)
                .await?;

        Ok(Some(Room {
            session_id: session_id.to_owned(),
            host_id,
            participants: participants.into_iter().collect::<BTreeMap<_, _>>(),
            created_at,
            active,
        }))
    }

    async fn join_room(&self, session_id: &str, user_id: &str, name: &str, max: usize) -> StoreResult<()> {
        let joined = sqlx::query(
            "INSERT INTO participants (session_id,user_id,name)
             SELECT ?,?,? WHERE EXISTS (SELECT 1 FROM rooms WHERE session_id=? AND active=1)
               AND (EXISTS (SELECT 1 FROM participants WHERE session_id=? AND user_id=?)
                    OR (SELECT count(*) FROM participants WHERE session_id=?) < ?)
             ON CONFLICT(session_id,user_id) DO UPDATE SET name=excluded.name",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(name)
        .bind(session_id)
        .bind(session_id)
        .bind(user_id)
        .bind(session_id)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .execute(&self.db_pool)
        .await?
        .rows_affected();

        if joined > 0 {
            return Ok(());
        }

        let active: Option<bool> = sqlx::query_scalar("SELECT active FROM rooms WHERE session_id=?")
            .bind(session_id)
            .fetch_optional(&self.db_pool)
            .await?;
        Err(match active {
            None => StoreError::RoomNotFound(session_id.to_owned()),
            Some(false) => StoreError::RoomEnded(session_id.to_owned()),
            Some(true) => StoreError::RoomFull { max },
        })
    }

    async fn active_rooms(&self) -> StoreResult<Vec<Room>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT session_id FROM rooms WHERE active=1")
            .fetch_all(&self.db_pool)
            .await?;

        let mut rooms = Vec::with_capacity(ids.len());
        for session_id in ids {
            if let Some(room) = self.room(&session_id).await? {
                rooms.push(room);
            }
        }
        Ok(rooms)
    }

    async fn remove_participant(&self, session_id: &str, user_id: &str) -> StoreResult<bool> {
        let removed = sqlx::query("DELETE FROM participants WHERE session_id=? AND user_id=?")
            .bind(session_id)
            .bind(user_id)
            .execute(&self.db_pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    async fn end_room(&self, session_id: &str) -> StoreResult<bool> {
        let ended = sqlx::query("UPDATE rooms SET active=0 WHERE session_id=? AND active=1")
            .bind(session_id)
            .execute(&self.db_pool)
            .await?
            .rows_affected();
        Ok(ended > 0)
    }

    async fn put_offer(&self, session_id: &str, offer: &SignalRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO offers (session_id,user_id,type,sdp,user_name,timestamp)
             SELECT ?,?,?,?,?,? WHERE EXISTS (SELECT 1 FROM rooms WHERE session_id=?)
             ON CONFLICT(session_id,user_id) DO UPDATE SET
                type=excluded.type, sdp=excluded.sdp,
                user_name=excluded.user_name, timestamp=excluded.timestamp",
        )
        .bind(session_id)
        .bind(&offer.user_id)
        .bind(offer.description.kind.to_string())
        .bind(&offer.description.sdp)
        .bind(&offer.user_name)
        .bind(offer.timestamp)
        .bind(session_id)
        .execute(&self.db_pool)
        .await
        .map_err(StoreError::from)
        .and_then(|result| match result.rows_affected() {
            0 => Err(StoreError::RoomNotFound(session_id.to_owned())),
            _ => Ok(()),
        })
    }

    async fn offers(&self, session_id: &str) -> StoreResult<Vec<SignalRecord>> {
        let rows: Vec<SignalRow> = sqlx::query_as(
            "SELECT type,sdp,user_id,user_name,timestamp FROM offers
             WHERE session_id=? ORDER BY timestamp, user_id",
        )
        .bind(session_id)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(signal_from_row).collect()
    }

    async fn put_answer(&self, session_id: &str, to: &str, answer: &SignalRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO answers (session_id,to_user_id,user_id,type,sdp,user_name,timestamp)
             SELECT ?,?,?,?,?,?,? WHERE EXISTS (SELECT 1 FROM rooms WHERE session_id=?)
             ON CONFLICT(session_id,to_user_id) DO UPDATE SET
                user_id=excluded.user_id, type=excluded.type, sdp=excluded.sdp,
                user_name=excluded.user_name, timestamp=excluded.timestamp",
        )
        .bind(session_id)
        .bind(to)
        .bind(&answer.user_id)
        .bind(answer.description.kind.to_string())
        .bind(&answer.description.sdp)
        .bind(&answer.user_name)
        .bind(answer.timestamp)
        .bind(session_id)
        .execute(&self.db_pool)
        .await
        .map_err(StoreError::from)
        .and_then(|result| match result.rows_affected() {
            0 => Err(StoreError::RoomNotFound(session_id.to_owned())),
            _ => Ok(()),
        })
    }

    async fn answer(&self, session_id: &str, to: &str) -> StoreResult<Option<SignalRecord>> {
        let row: Option<SignalRow> = sqlx::query_as(
            "SELECT type,sdp,user_id,user_name,timestamp FROM answers
             WHERE session_id=? AND to_user_id=?",
        )
        .bind(session_id)
        .bind(to)
        .fetch_optional(&self.db_pool)
        .await?;

        row.map(signal_from_row).transpose()
    }

    async fn clear_signals(&self, session_id: &str, user_id: &str) -> StoreResult<()> {
        let mut tx = self.db_pool.begin().await?;
        sqlx::query("DELETE FROM offers WHERE session_id=? AND user_id=?")
            .bind(session_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM answers WHERE session_id=? AND to_user_id=?")
            .bind(session_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_message(&self, session_id: &str, message: &ChatMessage) -> StoreResult<()> {
        let inserted = sqlx::query(
            "INSERT INTO messages (id,session_id,user_id,user_name,text,timestamp)
             SELECT ?,?,?,?,?,? WHERE EXISTS (SELECT 1 FROM rooms WHERE session_id=?)",
        )
        .bind(message.id.to_string())
        .bind(session_id)
        .bind(&message.user_id)
        .bind(&message.user_name)
        .bind(&message.text)
        .bind(message.timestamp)
        .bind(session_id)
        .execute(&self.db_pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::RoomNotFound(session_id.to_owned()));
        }
        Ok(())
    }

    async fn messages(&self, session_id: &str, limit: usize) -> StoreResult<Vec<ChatMessage>> {
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id,user_id,user_name,text,timestamp FROM (
                SELECT seq,id,user_id,user_name,text,timestamp FROM messages
                WHERE session_id=? ORDER BY timestamp DESC, seq DESC LIMIT ?
             ) ORDER BY timestamp ASC, seq ASC",
        )
        .bind(session_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|(id, user_id, user_name, text, timestamp)| {
                Ok(ChatMessage {
                    id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    user_id,
                    user_name,
                    text,
                    timestamp,
                })
            })
            .collect()
    }
}
