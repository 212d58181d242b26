use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::model::{MediaPermission, SessionId, UserId};

#[derive(Debug, Clone, Copy)]
struct Lease {
    expires_at: Instant,
    media: MediaPermission,
}

/// Heartbeat leases for everyone currently in a room. A participant whose lease
/// runs out without renewal is handed back by [`Presence::expire`].
#[derive(Debug)]
pub struct Presence {
    ttl: Duration,
    leases: HashMap<SessionId, HashMap<UserId, Lease>>,
}

impl Presence {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            leases: HashMap::new(),
        }
    }

    /// Starts or restarts a lease, keeping the last reported media state.
    pub fn grant(&mut self, session_id: &str, user_id: &str, now: Instant) {
        let expires_at = now + self.ttl;
        self.leases
            .entry(session_id.to_owned())
            .or_default()
            .entry(user_id.to_owned())
            .and_modify(|lease| lease.expires_at = expires_at)
            .or_insert(Lease {
                expires_at,
                media: MediaPermission::Unknown,
            });
    }

    /// Extends a lease that is still live. Returns false for unknown or lapsed ones.
    pub fn renew(&mut self, session_id: &str, user_id: &str, now: Instant) -> bool {
        let ttl = self.ttl;
        match self.lease_mut(session_id, user_id) {
            Some(lease) if lease.expires_at > now => {
                lease.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    pub fn is_live(&self, session_id: &str, user_id: &str, now: Instant) -> bool {
        self.leases
            .get(session_id)
            .and_then(|users| users.get(user_id))
            .is_some_and(|lease| lease.expires_at > now)
    }

    /// Whether any lease exists, lapsed or not.
    pub fn holds(&self, session_id: &str, user_id: &str) -> bool {
        self.leases
            .get(session_id)
            .is_some_and(|users| users.contains_key(user_id))
    }

    pub fn set_media(&mut self, session_id: &str, user_id: &str, media: MediaPermission) -> bool {
        match self.lease_mut(session_id, user_id) {
            Some(lease) => {
                lease.media = media;
                true
            }
            None => false,
        }
    }

    pub fn media(&self, session_id: &str) -> HashMap<UserId, MediaPermission> {
        self.leases
            .get(session_id)
            .map(|users| {
                users
                    .iter()
                    .map(|(user_id, lease)| (user_id.clone(), lease.media))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn revoke(&mut self, session_id: &str, user_id: &str) -> bool {
        let Some(users) = self.leases.get_mut(session_id) else {
            return false;
        };

        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.leases.remove(session_id);
        }
        removed
    }

    pub fn revoke_session(&mut self, session_id: &str) {
        self.leases.remove(session_id);
    }

    /// Removes and returns every lease that lapsed at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(SessionId, UserId)> {
        let mut expired = Vec::new();

        self.leases.retain(|session_id, users| {
            users.retain(|user_id, lease| {
                let live = lease.expires_at > now;
                if !live {
                    expired.push((session_id.clone(), user_id.clone()));
                }
                live
            });
            !users.is_empty()
        });

        expired
    }

    fn lease_mut(&mut self, session_id: &str, user_id: &str) -> Option<&mut Lease> {
        self.leases.get_mut(session_id)?.get_mut(user_id)
    }
}
