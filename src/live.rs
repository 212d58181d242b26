//! The live session service: room lifecycle, presence, signaling and chat over
//! one injected [`RoomStore`].

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{
    sync::{broadcast, Mutex, OwnedMutexGuard},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::DEFAULT_STUN_URLS,
    hub::{Hub, LeaveReason, RoomEvent},
    model::{
        now_millis, ChatMessage, IceCandidate, IceServer, Identity, MediaPermission, Millis,
        Room, SdpType, SessionDescription, SessionId, SignalRecord, UserId,
    },
    presence::Presence,
    signaling::{validate_description, NegotiationState, SignalError, Side, Signaling},
    store::{RoomStore, StoreError},
};

const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// How long a participant stays without a heartbeat.
    pub lease: Duration,
    pub sweep_every: Duration,
    pub max_participants: usize,
    /// In characters.
    pub chat_max_len: usize,
    pub chat_history_limit: usize,
    pub ice_servers: Vec<IceServer>,
    /// Per-session broadcast capacity before slow subscribers start lagging.
    pub event_buffer: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            sweep_every: Duration::from_secs(5),
            max_participants: 16,
            chat_max_len: 2000,
            chat_history_limit: 200,
            ice_servers: DEFAULT_STUN_URLS.into_iter().map(IceServer::stun).collect(),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),
    #[error("session {0} does not exist")]
    RoomNotFound(SessionId),
    #[error("session {0} already exists")]
    RoomExists(SessionId),
    #[error("session {0} has ended")]
    RoomEnded(SessionId),
    #[error("session is full ({max} participants)")]
    RoomFull { max: usize },
    #[error("not a participant of this session")]
    NotParticipant,
    #[error("only the host can do that")]
    NotHost,
    #[error("the host answers offers and cannot send one")]
    HostCannotOffer,
    #[error("message is empty")]
    EmptyMessage,
    #[error("message is longer than {max} characters")]
    MessageTooLong { max: usize },
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("store failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LiveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RoomExists(id) => LiveError::RoomExists(id),
            StoreError::RoomNotFound(id) => LiveError::RoomNotFound(id),
            StoreError::RoomEnded(id) => LiveError::RoomEnded(id),
            StoreError::RoomFull { max } => LiveError::RoomFull { max },
            err => LiveError::Store(err),
        }
    }
}

pub type LiveResult<T> = Result<T, LiveError>;

/// A room as seen by one of its participants.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    #[serde(flatten)]
    pub room: Room,
    pub media: BTreeMap<UserId, MediaPermission>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationView {
    pub participant: UserId,
    pub state: NegotiationState,
    pub offer: Option<SignalRecord>,
    pub answer: Option<SignalRecord>,
}

/// One async lock per session, created on first use.
struct SessionLocks<T> {
    slots: std::sync::Mutex<HashMap<SessionId, Arc<Mutex<T>>>>,
}

impl<T: Default> SessionLocks<T> {
    fn new() -> Self {
        Self {
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, session_id: &str) -> OwnedMutexGuard<T> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(slots.entry(session_id.to_owned()).or_default())
        };
        slot.lock_owned().await
    }

    fn forget(&self, session_id: &str) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }
}

pub struct Live {
    store: Arc<dyn RoomStore>,
    hub: Hub,
    presence: Mutex<Presence>,
    signaling: Mutex<Signaling>,
    /// Serializes joins, leaves, endings and expiries within a session.
    membership: SessionLocks<()>,
    /// Last chat timestamp handed out per session. Held while a message is
    /// stamped, stored and published, so live order matches timestamp order.
    chat: SessionLocks<Millis>,
    config: LiveConfig,
}

impl Live {
    pub fn new(store: Arc<dyn RoomStore>, config: LiveConfig) -> Self {
        Self {
            store,
            hub: Hub::new(config.event_buffer),
            presence: Mutex::new(Presence::new(config.lease)),
            signaling: Mutex::new(Signaling::new()),
            membership: SessionLocks::new(),
            chat: SessionLocks::new(),
            config,
        }
    }

    /// Leases everyone the store still lists in an active room. Presence is not
    /// persisted, so after a restart this lets participants who never come back
    /// expire like any other.
    pub async fn restore(&self) -> LiveResult<usize> {
        let rooms = self.store.active_rooms().await?;
        let now = Instant::now();
        let mut leased = 0;

        let mut presence = self.presence.lock().await;
        let mut signaling = self.signaling.lock().await;
        for room in &rooms {
            for user_id in room.participants.keys() {
                presence.grant(&room.session_id, user_id, now);
                if !room.is_host(user_id) {
                    signaling.open(&room.session_id, user_id);
                }
                leased += 1;
            }
        }

        info!(rooms = rooms.len(), leased, "presence restored from store");
        Ok(leased)
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.config.ice_servers
    }

    /// Opens a new session with `who` as host. A missing id gets a generated one.
    pub async fn host(&self, session_id: Option<String>, who: &Identity) -> LiveResult<Room> {
        let session_id = match session_id.map(|id| id.trim().to_owned()) {
            Some(id) => {
                check_session_id(&id)?;
                id
            }
            None => Uuid::now_v7().simple().to_string(),
        };

        let room = Room::new(session_id, who);
        self.store.create_room(&room).await?;
        self.presence
            .lock()
            .await
            .grant(&room.session_id, &who.user_id, Instant::now());

        info!(session_id = %room.session_id, host = %who.user_id, "session hosted");
        Ok(room)
    }

    pub async fn join(&self, session_id: &str, who: &Identity) -> LiveResult<RoomView> {
        let _membership = self.membership.lock(session_id).await;
        let room = self.room_record(session_id).await?;

        self.store
            .join_room(session_id, &who.user_id, &who.name, self.config.max_participants)
            .await?;
        self.presence
            .lock()
            .await
            .grant(session_id, &who.user_id, Instant::now());
        if !room.is_host(&who.user_id) {
            self.signaling.lock().await.open(session_id, &who.user_id);
        }

        self.hub.publish(
            session_id,
            RoomEvent::ParticipantJoined {
                user_id: who.user_id.clone(),
                name: who.name.clone(),
            },
        );
        info!(session_id, user_id = %who.user_id, "participant joined");

        self.view(session_id).await
    }

    /// Removes `who` from the room. The host leaving ends the session.
    pub async fn leave(&self, session_id: &str, who: &Identity) -> LiveResult<()> {
        let _membership = self.membership.lock(session_id).await;
        let room = self.room_record(session_id).await?;
        if !room.has_participant(&who.user_id) {
            return Err(LiveError::NotParticipant);
        }

        if room.is_host(&who.user_id) && room.active {
            return self.finish(session_id).await;
        }

        self.drop_participant(session_id, &who.user_id, LeaveReason::Left)
            .await
    }

    pub async fn end(&self, session_id: &str, who: &Identity) -> LiveResult<()> {
        let _membership = self.membership.lock(session_id).await;
        let room = self.room_record(session_id).await?;
        if !room.is_host(&who.user_id) {
            return Err(LiveError::NotHost);
        }
        if !room.active {
            return Err(LiveError::RoomEnded(session_id.to_owned()));
        }

        self.finish(session_id).await
    }

    pub async fn room(&self, session_id: &str, who: &Identity) -> LiveResult<RoomView> {
        let room = self.room_record(session_id).await?;
        if !room.has_participant(&who.user_id) {
            return Err(LiveError::NotParticipant);
        }

        let media = self.presence.lock().await.media(session_id);
        Ok(RoomView {
            room,
            media: media.into_iter().collect(),
        })
    }

    pub async fn heartbeat(&self, session_id: &str, who: &Identity) -> LiveResult<()> {
        if self
            .presence
            .lock()
            .await
            .renew(session_id, &who.user_id, Instant::now())
        {
            Ok(())
        } else {
            Err(LiveError::NotParticipant)
        }
    }

    pub async fn report_media(
        &self,
        session_id: &str,
        who: &Identity,
        permission: MediaPermission,
    ) -> LiveResult<()> {
        self.member(session_id, who).await?;
        if !self
            .presence
            .lock()
            .await
            .set_media(session_id, &who.user_id, permission)
        {
            return Err(LiveError::NotParticipant);
        }

        self.hub.publish(
            session_id,
            RoomEvent::MediaChanged {
                user_id: who.user_id.clone(),
                permission,
            },
        );
        Ok(())
    }

    /// Subscribes before taking the snapshot, so no event falls between the two.
    pub async fn subscribe(
        &self,
        session_id: &str,
        who: &Identity,
    ) -> LiveResult<(RoomView, broadcast::Receiver<RoomEvent>)> {
        self.member(session_id, who).await?;
        let rx = self.hub.subscribe(session_id);
        Ok((self.view(session_id).await?, rx))
    }

    pub async fn send_message(&self, session_id: &str, who: &Identity, text: &str) -> LiveResult<ChatMessage> {
        let room = self.member(session_id, who).await?;

        let text = text.trim();
        if text.is_empty() {
            return Err(LiveError::EmptyMessage);
        }
        if text.chars().count() > self.config.chat_max_len {
            return Err(LiveError::MessageTooLong {
                max: self.config.chat_max_len,
            });
        }

        let mut last = self.chat.lock(session_id).await;
        let timestamp = now_millis().max(*last);
        let message = ChatMessage {
            id: Uuid::now_v7(),
            user_id: who.user_id.clone(),
            user_name: room
                .participants
                .get(&who.user_id)
                .cloned()
                .unwrap_or_else(|| who.name.clone()),
            text: text.to_owned(),
            timestamp,
        };

        self.store.append_message(session_id, &message).await?;
        *last = timestamp;
        self.hub.publish(session_id, RoomEvent::Message(message.clone()));
        drop(last);

        debug!(session_id, user_id = %who.user_id, "message sent");
        Ok(message)
    }

    pub async fn messages(
        &self,
        session_id: &str,
        who: &Identity,
        limit: Option<usize>,
    ) -> LiveResult<Vec<ChatMessage>> {
        let room = self.room_record(session_id).await?;
        if !room.has_participant(&who.user_id) {
            return Err(LiveError::NotParticipant);
        }

        let cap = self.config.chat_history_limit;
        let limit = limit.map_or(cap, |limit| limit.min(cap));
        Ok(self.store.messages(session_id, limit).await?)
    }

    pub async fn publish_offer(
        &self,
        session_id: &str,
        who: &Identity,
        description: SessionDescription,
    ) -> LiveResult<SignalRecord> {
        let room = self.member(session_id, who).await?;
        if room.is_host(&who.user_id) {
            return Err(LiveError::HostCannotOffer);
        }
        validate_description(&description, SdpType::Offer)?;

        self.signaling.lock().await.offer(session_id, &who.user_id)?;

        let offer = SignalRecord {
            description,
            user_id: who.user_id.clone(),
            user_name: who.name.clone(),
            timestamp: now_millis(),
        };
        self.store.clear_signals(session_id, &who.user_id).await?;
        self.store.put_offer(session_id, &offer).await?;

        self.hub.publish(
            session_id,
            RoomEvent::Offer {
                to: room.host_id.clone(),
                offer: offer.clone(),
            },
        );
        info!(session_id, user_id = %who.user_id, "offer published");
        Ok(offer)
    }

    /// Offers waiting for the host, one per participant.
    pub async fn offers(&self, session_id: &str, who: &Identity) -> LiveResult<Vec<SignalRecord>> {
        let room = self.member(session_id, who).await?;
        if !room.is_host(&who.user_id) {
            return Err(LiveError::NotHost);
        }
        Ok(self.store.offers(session_id).await?)
    }

    pub async fn publish_answer(
        &self,
        session_id: &str,
        who: &Identity,
        to: &str,
        description: SessionDescription,
    ) -> LiveResult<SignalRecord> {
        let room = self.member(session_id, who).await?;
        if !room.is_host(&who.user_id) {
            return Err(LiveError::NotHost);
        }
        validate_description(&description, SdpType::Answer)?;

        self.signaling.lock().await.answer(session_id, to)?;

        let answer = SignalRecord {
            description,
            user_id: who.user_id.clone(),
            user_name: who.name.clone(),
            timestamp: now_millis(),
        };
        self.store.put_answer(session_id, to, &answer).await?;

        self.hub.publish(
            session_id,
            RoomEvent::Answer {
                to: to.to_owned(),
                answer: answer.clone(),
            },
        );
        info!(session_id, to, "answer published");
        Ok(answer)
    }

    /// The host's answer to `who`'s offer, once there is one.
    pub async fn answer(&self, session_id: &str, who: &Identity) -> LiveResult<Option<SignalRecord>> {
        self.member(session_id, who).await?;
        Ok(self.store.answer(session_id, &who.user_id).await?)
    }

    pub async fn add_ice_candidate(
        &self,
        session_id: &str,
        who: &Identity,
        peer: &str,
        candidate: IceCandidate,
    ) -> LiveResult<()> {
        let room = self.member(session_id, who).await?;
        let (participant, side) = pair(&room, &who.user_id, peer)?;

        self.signaling
            .lock()
            .await
            .add_candidate(session_id, &participant, side, candidate.clone())?;

        self.hub.publish(
            session_id,
            RoomEvent::IceCandidate {
                to: peer.to_owned(),
                from: who.user_id.clone(),
                candidate,
            },
        );
        Ok(())
    }

    /// Drains the candidates `peer` sent to `who` that were not yet collected.
    pub async fn take_ice_candidates(
        &self,
        session_id: &str,
        who: &Identity,
        peer: &str,
    ) -> LiveResult<Vec<IceCandidate>> {
        let room = self.member(session_id, who).await?;
        let (participant, side) = pair(&room, &who.user_id, peer)?;

        Ok(self
            .signaling
            .lock()
            .await
            .take_candidates(session_id, &participant, side)?)
    }

    pub async fn mark_connected(&self, session_id: &str, who: &Identity, peer: &str) -> LiveResult<()> {
        let room = self.member(session_id, who).await?;
        let (participant, _) = pair(&room, &who.user_id, peer)?;

        let newly = self
            .signaling
            .lock()
            .await
            .connect(session_id, &participant)?;
        if newly {
            self.hub.publish(
                session_id,
                RoomEvent::PeerConnected {
                    user_id: participant.clone(),
                },
            );
            info!(session_id, participant = %participant, "peer connected");
        }
        Ok(())
    }

    pub async fn negotiation(&self, session_id: &str, who: &Identity, peer: &str) -> LiveResult<NegotiationView> {
        let room = self.member(session_id, who).await?;
        let (participant, _) = pair(&room, &who.user_id, peer)?;

        let state = self
            .signaling
            .lock()
            .await
            .state(session_id, &participant)
            .ok_or_else(|| SignalError::UnknownPeer(participant.clone()))?;

        let offer = self
            .store
            .offers(session_id)
            .await?
            .into_iter()
            .find(|offer| offer.user_id == participant);
        let answer = self.store.answer(session_id, &participant).await?;

        Ok(NegotiationView {
            participant,
            state,
            offer,
            answer,
        })
    }

    /// Removes everyone whose lease ran out by `now`. An expired host ends the session.
    /// Returns who was removed.
    pub async fn sweep_expired(&self, now: Instant) -> Vec<(SessionId, UserId)> {
        let lapsed = self.presence.lock().await.expire(now);
        let mut expired = Vec::with_capacity(lapsed.len());

        for (session_id, user_id) in lapsed {
            let _membership = self.membership.lock(&session_id).await;
            // Re-joined after the lease lapsed.
            if self.presence.lock().await.holds(&session_id, &user_id) {
                debug!(session_id = %session_id, user_id = %user_id, "lease renewed by a join, keeping");
                continue;
            }

            let result = match self.store.room(&session_id).await {
                Ok(Some(room)) if room.is_host(&user_id) && room.active => {
                    info!(session_id = %session_id, "host lease expired, ending session");
                    self.finish(&session_id).await
                }
                Ok(Some(_)) => {
                    self.drop_participant(&session_id, &user_id, LeaveReason::Expired)
                        .await
                }
                Ok(None) => Ok(()),
                Err(err) => Err(err.into()),
            };

            if let Err(err) = result {
                warn!(session_id = %session_id, user_id = %user_id, %err, "failed to expire participant");
            }
            expired.push((session_id, user_id));
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "expired participants removed");
        }
        expired
    }

    /// Sweeps expired leases every `sweep_every` until aborted.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let live = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(live.config.sweep_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                live.sweep_expired(Instant::now()).await;
            }
        })
    }

    async fn finish(&self, session_id: &str) -> LiveResult<()> {
        let ended = self.store.end_room(session_id).await?;
        self.presence.lock().await.revoke_session(session_id);
        self.signaling.lock().await.close_session(session_id);

        if ended {
            self.hub.publish(session_id, RoomEvent::SessionEnded);
            info!(session_id, "session ended");
        }
        self.hub.close(session_id);
        self.chat.forget(session_id);
        self.membership.forget(session_id);
        Ok(())
    }

    async fn drop_participant(&self, session_id: &str, user_id: &str, reason: LeaveReason) -> LiveResult<()> {
        let removed = self.store.remove_participant(session_id, user_id).await?;
        self.store.clear_signals(session_id, user_id).await?;
        self.presence.lock().await.revoke(session_id, user_id);
        {
            let mut signaling = self.signaling.lock().await;
            signaling.disconnect(session_id, user_id);
            signaling.close(session_id, user_id);
        }

        if removed {
            self.hub.publish(
                session_id,
                RoomEvent::ParticipantLeft {
                    user_id: user_id.to_owned(),
                    reason,
                },
            );
            info!(session_id, user_id, ?reason, "participant left");
        }
        Ok(())
    }

    async fn room_record(&self, session_id: &str) -> LiveResult<Room> {
        self.store
            .room(session_id)
            .await?
            .ok_or_else(|| LiveError::RoomNotFound(session_id.to_owned()))
    }

    async fn active_room(&self, session_id: &str) -> LiveResult<Room> {
        let room = self.room_record(session_id).await?;
        if !room.active {
            return Err(LiveError::RoomEnded(session_id.to_owned()));
        }
        Ok(room)
    }

    /// The active room, if `who` is in it and their lease has not lapsed.
    async fn member(&self, session_id: &str, who: &Identity) -> LiveResult<Room> {
        let room = self.active_room(session_id).await?;
        let live = room.has_participant(&who.user_id)
            && self
                .presence
                .lock()
                .await
                .is_live(session_id, &who.user_id, Instant::now());
        if !live {
            return Err(LiveError::NotParticipant);
        }
        Ok(room)
    }

    async fn view(&self, session_id: &str) -> LiveResult<RoomView> {
        let room = self.room_record(session_id).await?;
        let media = self.presence.lock().await.media(session_id);
        Ok(RoomView {
            room,
            media: media.into_iter().collect(),
        })
    }
}

/// Resolves whose negotiation a signal between `who` and `peer` belongs to, and
/// which side `who` is on. Participants only ever signal with the host.
fn pair(room: &Room, who: &str, peer: &str) -> LiveResult<(UserId, Side)> {
    if room.is_host(who) {
        if peer == who || !room.has_participant(peer) {
            return Err(SignalError::UnknownPeer(peer.to_owned()).into());
        }
        Ok((peer.to_owned(), Side::Host))
    } else if room.is_host(peer) {
        Ok((who.to_owned(), Side::Participant))
    } else {
        Err(SignalError::UnknownPeer(peer.to_owned()).into())
    }
}

fn check_session_id(id: &str) -> LiveResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(LiveError::InvalidSessionId(id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    use super::*;
    use crate::store::{MemoryStore, SqliteStore};

    fn ident(user_id: &str, name: &str) -> Identity {
        Identity {
            user_id: user_id.to_owned(),
            name: name.to_owned(),
        }
    }

    fn live() -> Live {
        Live::new(Arc::new(MemoryStore::new()), LiveConfig::default())
    }

    fn offer_sdp() -> SessionDescription {
        SessionDescription {
            kind: SdpType::Offer,
            sdp: "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n".to_owned(),
        }
    }

    fn answer_sdp() -> SessionDescription {
        SessionDescription {
            kind: SdpType::Answer,
            sdp: "v=0\r\no=- 2 2 IN IP4 0.0.0.0\r\n".to_owned(),
        }
    }

    #[tokio::test]
    async fn host_then_join_then_handshake() {
        let live = live();
        let host = ident("H", "Host Name");
        let pat = ident("P", "Pat");

        let room = live.host(Some("s1".to_owned()), &host).await.unwrap();
        assert_eq!(room.host_id, "H");
        assert_eq!(
            room.participants,
            BTreeMap::from([("H".to_owned(), "Host Name".to_owned())])
        );

        let view = live.join("s1", &pat).await.unwrap();
        assert_eq!(view.room.participants.len(), 2);
        assert_eq!(view.room.participants.get("P").map(String::as_str), Some("Pat"));

        live.publish_offer("s1", &pat, offer_sdp()).await.unwrap();
        let offers = live.offers("s1", &host).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].user_id, "P");
        assert_eq!(offers[0].description.kind, SdpType::Offer);

        // No answer until the host writes one.
        assert!(live.answer("s1", &pat).await.unwrap().is_none());

        live.publish_answer("s1", &host, "P", answer_sdp()).await.unwrap();
        let answer = live.answer("s1", &pat).await.unwrap().unwrap();
        assert_eq!(answer.user_id, "H");
        assert_eq!(answer.description, answer_sdp());

        live.mark_connected("s1", &pat, "H").await.unwrap();
        let negotiation = live.negotiation("s1", &host, "P").await.unwrap();
        assert_eq!(negotiation.state, NegotiationState::Connected);
        assert!(negotiation.offer.is_some());
        assert!(negotiation.answer.is_some());
    }

    #[tokio::test]
    async fn joining_a_missing_session_is_rejected() {
        let live = live();
        let err = live.join("ghost", &ident("P", "Pat")).await.unwrap_err();
        assert!(matches!(err, LiveError::RoomNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn second_host_cannot_clobber_a_room() {
        let live = live();
        live.host(Some("s1".to_owned()), &ident("H", "Host")).await.unwrap();

        let err = live
            .host(Some("s1".to_owned()), &ident("X", "Other"))
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::RoomExists(_)));

        let view = live.room("s1", &ident("H", "Host")).await.unwrap();
        assert_eq!(view.room.host_id, "H");
    }

    #[tokio::test]
    async fn generated_and_invalid_session_ids() {
        let live = live();
        let room = live.host(None, &ident("H", "Host")).await.unwrap();
        assert_eq!(room.session_id.len(), 32);

        let err = live
            .host(Some("../etc".to_owned()), &ident("H", "Host"))
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::InvalidSessionId(_)));
    }

    #[tokio::test]
    async fn offers_are_validated_before_storage() {
        let live = live();
        let host = ident("H", "Host");
        let pat = ident("P", "Pat");
        live.host(Some("s1".to_owned()), &host).await.unwrap();
        live.join("s1", &pat).await.unwrap();

        let blank = SessionDescription {
            kind: SdpType::Offer,
            sdp: String::new(),
        };
        assert!(matches!(
            live.publish_offer("s1", &pat, blank).await,
            Err(LiveError::Signal(SignalError::InvalidPayload(_)))
        ));
        assert!(matches!(
            live.publish_offer("s1", &pat, answer_sdp()).await,
            Err(LiveError::Signal(SignalError::InvalidPayload(_)))
        ));
        assert!(matches!(
            live.publish_offer("s1", &host, offer_sdp()).await,
            Err(LiveError::HostCannotOffer)
        ));
        assert!(live.offers("s1", &host).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_the_host_answers() {
        let live = live();
        let host = ident("H", "Host");
        let pat = ident("P", "Pat");
        let quinn = ident("Q", "Quinn");
        live.host(Some("s1".to_owned()), &host).await.unwrap();
        live.join("s1", &pat).await.unwrap();
        live.join("s1", &quinn).await.unwrap();
        live.publish_offer("s1", &pat, offer_sdp()).await.unwrap();

        assert!(matches!(
            live.publish_answer("s1", &quinn, "P", answer_sdp()).await,
            Err(LiveError::NotHost)
        ));
        assert!(matches!(
            live.publish_answer("s1", &host, "Q", answer_sdp()).await,
            Err(LiveError::Signal(SignalError::InvalidTransition { .. }))
        ));
    }

    #[tokio::test]
    async fn chat_is_ordered_and_validated() {
        let live = Live::new(
            Arc::new(MemoryStore::new()),
            LiveConfig {
                chat_max_len: 5,
                ..LiveConfig::default()
            },
        );
        let host = ident("H", "Host");
        live.host(Some("s1".to_owned()), &host).await.unwrap();

        for text in ["one", "two", "three"] {
            live.send_message("s1", &host, text).await.unwrap();
        }
        assert!(matches!(
            live.send_message("s1", &host, "   ").await,
            Err(LiveError::EmptyMessage)
        ));
        assert!(matches!(
            live.send_message("s1", &host, "too long").await,
            Err(LiveError::MessageTooLong { max: 5 })
        ));

        let history = live.messages("s1", &host, None).await.unwrap();
        let texts: Vec<_> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["one", "two", "three"]);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let outsider = ident("X", "Outsider");
        assert!(matches!(
            live.send_message("s1", &outsider, "hi").await,
            Err(LiveError::NotParticipant)
        ));
    }

    #[tokio::test]
    async fn subscribers_see_messages_in_send_order() {
        let live = live();
        let host = ident("H", "Host");
        let pat = ident("P", "Pat");
        live.host(Some("s1".to_owned()), &host).await.unwrap();
        live.join("s1", &pat).await.unwrap();

        let (_, mut rx) = live.subscribe("s1", &pat).await.unwrap();
        live.send_message("s1", &host, "first").await.unwrap();
        live.send_message("s1", &pat, "second").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RoomEvent::Message(message) = event {
                seen.push((message.text, message.timestamp));
            }
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "first");
        assert_eq!(seen[1].0, "second");
        assert!(seen[0].1 <= seen[1].1);
    }

    #[tokio::test]
    async fn expired_participant_is_removed_and_announced() {
        let live = live();
        let host = ident("H", "Host");
        let pat = ident("P", "Pat");
        live.host(Some("s1".to_owned()), &host).await.unwrap();
        live.join("s1", &pat).await.unwrap();
        let (_, mut rx) = live.subscribe("s1", &host).await.unwrap();

        // Only the host keeps heartbeating.
        let later = Instant::now() + Duration::from_secs(20);
        assert!(live.presence.lock().await.renew("s1", "H", later));
        let expired = live.sweep_expired(later + Duration::from_secs(15)).await;

        assert_eq!(expired, vec![("s1".to_owned(), "P".to_owned())]);
        let view = live.room("s1", &host).await.unwrap();
        assert!(!view.room.has_participant("P"));
        assert!(view.room.active);
        assert_eq!(
            rx.try_recv().unwrap(),
            RoomEvent::ParticipantLeft {
                user_id: "P".to_owned(),
                reason: LeaveReason::Expired,
            }
        );
        assert!(matches!(
            live.heartbeat("s1", &pat).await,
            Err(LiveError::NotParticipant)
        ));
    }

    #[tokio::test]
    async fn expired_host_ends_the_session() {
        let live = live();
        let host = ident("H", "Host");
        live.host(Some("s1".to_owned()), &host).await.unwrap();

        live.sweep_expired(Instant::now() + Duration::from_secs(31)).await;

        let view = live.room("s1", &host).await.unwrap();
        assert!(!view.room.active);
        assert!(matches!(
            live.join("s1", &ident("P", "Pat")).await,
            Err(LiveError::RoomEnded(_))
        ));
    }

    #[tokio::test]
    async fn sweep_keeps_a_participant_who_rejoined_meanwhile() {
        let live = Arc::new(live());
        let host = ident("H", "Host");
        let pat = ident("P", "Pat");
        live.host(Some("s1".to_owned()), &host).await.unwrap();
        live.join("s1", &pat).await.unwrap();

        let later = Instant::now() + Duration::from_secs(20);
        assert!(live.presence.lock().await.renew("s1", "H", later));

        let membership = live.membership.lock("s1").await;
        let sweep = tokio::spawn({
            let live = Arc::clone(&live);
            async move { live.sweep_expired(later + Duration::from_secs(15)).await }
        });
        while live.presence.lock().await.holds("s1", "P") {
            tokio::task::yield_now().await;
        }
        // The lease lapsed and the sweep is waiting; a join lands first.
        live.presence.lock().await.grant("s1", "P", Instant::now());
        drop(membership);

        assert!(sweep.await.unwrap().is_empty());
        let view = live.room("s1", &pat).await.unwrap();
        assert!(view.room.has_participant("P"));
        live.heartbeat("s1", &pat).await.unwrap();
    }

    async fn file_store(path: &std::path::Path) -> SqliteStore {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let db_pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .unwrap();
        SqliteStore::new(db_pool).await.unwrap()
    }

    fn scratch_db() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("speakspace-{}.db", Uuid::now_v7().simple()))
    }

    #[tokio::test]
    async fn participants_left_over_from_a_restart_expire() {
        let path = scratch_db();
        let host = ident("H", "Host");
        let pat = ident("P", "Pat");

        let before = Live::new(Arc::new(file_store(&path).await), LiveConfig::default());
        before.host(Some("s1".to_owned()), &host).await.unwrap();
        before.join("s1", &pat).await.unwrap();
        drop(before);

        let after = Live::new(Arc::new(file_store(&path).await), LiveConfig::default());
        assert_eq!(after.restore().await.unwrap(), 2);
        // Nobody came back.
        let mut expired = after
            .sweep_expired(Instant::now() + Duration::from_secs(31))
            .await;
        expired.sort();
        assert_eq!(
            expired,
            vec![
                ("s1".to_owned(), "H".to_owned()),
                ("s1".to_owned(), "P".to_owned()),
            ]
        );

        let room = after.store.room("s1").await.unwrap().unwrap();
        assert!(!room.active);
        assert!(!room.has_participant("P"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn restored_participants_keep_working_until_their_lease_lapses() {
        let path = scratch_db();
        let host = ident("H", "Host");
        let pat = ident("P", "Pat");

        let before = Live::new(Arc::new(file_store(&path).await), LiveConfig::default());
        before.host(Some("s1".to_owned()), &host).await.unwrap();
        before.join("s1", &pat).await.unwrap();
        drop(before);

        let after = Live::new(Arc::new(file_store(&path).await), LiveConfig::default());
        after.restore().await.unwrap();
        after.heartbeat("s1", &pat).await.unwrap();
        after.publish_offer("s1", &pat, offer_sdp()).await.unwrap();
        assert_eq!(after.offers("s1", &host).await.unwrap().len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_stop_at_capacity() {
        let path = scratch_db();
        let stores: [Arc<dyn RoomStore>; 2] = [
            Arc::new(MemoryStore::new()),
            Arc::new(file_store(&path).await),
        ];

        for store in stores {
            let live = Arc::new(Live::new(
                store,
                LiveConfig {
                    max_participants: 3,
                    ..LiveConfig::default()
                },
            ));
            live.host(Some("s1".to_owned()), &ident("H", "Host")).await.unwrap();

            let joins: Vec<_> = (0..8)
                .map(|n| {
                    let live = Arc::clone(&live);
                    tokio::spawn(async move { live.join("s1", &ident(&format!("P{n}"), "Pat")).await })
                })
                .collect();

            let mut joined = 0;
            for join in joins {
                match join.await.unwrap() {
                    Ok(_) => joined += 1,
                    Err(err) => assert!(matches!(err, LiveError::RoomFull { max: 3 })),
                }
            }

            assert_eq!(joined, 2);
            let room = live.store.room("s1").await.unwrap().unwrap();
            assert_eq!(room.participants.len(), 3);
        }

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn joins_racing_an_end_leave_no_lease_behind() {
        let live = Arc::new(live());
        let host = ident("H", "Host");
        live.host(Some("s1".to_owned()), &host).await.unwrap();

        let joins: Vec<_> = (0..8)
            .map(|n| {
                let live = Arc::clone(&live);
                tokio::spawn(async move { live.join("s1", &ident(&format!("P{n}"), "Pat")).await })
            })
            .collect();
        live.end("s1", &host).await.unwrap();

        for join in joins {
            if let Err(err) = join.await.unwrap() {
                assert!(matches!(err, LiveError::RoomEnded(_)));
            }
        }
        assert!(live.presence.lock().await.media("s1").is_empty());
        assert!(live.signaling.lock().await.state("s1", "P0").is_none());
    }

    #[tokio::test]
    async fn leaving_clears_signals_and_host_leave_ends() {
        let live = live();
        let host = ident("H", "Host");
        let pat = ident("P", "Pat");
        live.host(Some("s1".to_owned()), &host).await.unwrap();
        live.join("s1", &pat).await.unwrap();
        live.publish_offer("s1", &pat, offer_sdp()).await.unwrap();

        live.leave("s1", &pat).await.unwrap();
        assert!(live.offers("s1", &host).await.unwrap().is_empty());
        assert!(matches!(
            live.leave("s1", &pat).await,
            Err(LiveError::NotParticipant)
        ));

        live.leave("s1", &host).await.unwrap();
        assert!(!live.room("s1", &host).await.unwrap().room.active);
    }

    #[tokio::test]
    async fn room_capacity_is_enforced() {
        let live = Live::new(
            Arc::new(MemoryStore::new()),
            LiveConfig {
                max_participants: 2,
                ..LiveConfig::default()
            },
        );
        live.host(Some("s1".to_owned()), &ident("H", "Host")).await.unwrap();
        live.join("s1", &ident("P", "Pat")).await.unwrap();

        assert!(matches!(
            live.join("s1", &ident("Q", "Quinn")).await,
            Err(LiveError::RoomFull { max: 2 })
        ));
        // Rejoining is not a new seat.
        live.join("s1", &ident("P", "Pat Again")).await.unwrap();
    }

    #[tokio::test]
    async fn ice_candidates_flow_between_host_and_participant_only() {
        let live = live();
        let host = ident("H", "Host");
        let pat = ident("P", "Pat");
        let quinn = ident("Q", "Quinn");
        live.host(Some("s1".to_owned()), &host).await.unwrap();
        live.join("s1", &pat).await.unwrap();
        live.join("s1", &quinn).await.unwrap();
        live.publish_offer("s1", &pat, offer_sdp()).await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:842163049 1 udp 1677729535 203.0.113.7 3478 typ srflx".to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        live.add_ice_candidate("s1", &pat, "H", candidate.clone())
            .await
            .unwrap();
        assert!(matches!(
            live.add_ice_candidate("s1", &pat, "Q", candidate.clone()).await,
            Err(LiveError::Signal(SignalError::UnknownPeer(_)))
        ));

        assert_eq!(
            live.take_ice_candidates("s1", &host, "P").await.unwrap(),
            vec![candidate]
        );
        assert!(live.take_ice_candidates("s1", &pat, "H").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn media_reports_show_in_room_view() {
        let live = live();
        let host = ident("H", "Host");
        live.host(Some("s1".to_owned()), &host).await.unwrap();

        live.report_media("s1", &host, MediaPermission::Denied).await.unwrap();
        let view = live.room("s1", &host).await.unwrap();
        assert_eq!(view.media.get("H"), Some(&MediaPermission::Denied));
    }
}
