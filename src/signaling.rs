//! Offer/answer negotiation between each participant and the session host.
//!
//! Every non-host participant owns one [`Negotiation`]; the host is always the
//! other end. The state only moves along
//! `idle -> offering -> answering -> connected`, with `disconnected` reachable
//! from anywhere and a fresh offer allowed again from `connected` (renegotiation)
//! or `disconnected` (reconnect).

use std::{collections::HashMap, fmt, mem};

use serde::Serialize;

use crate::model::{IceCandidate, SdpType, SessionDescription, SessionId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Connected,
    Disconnected,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Offer,
    Answer,
    IceCandidate,
    Connect,
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            SignalAction::Offer => "offer",
            SignalAction::Answer => "answer",
            SignalAction::IceCandidate => "send ice candidates",
            SignalAction::Connect => "connect",
        };
        f.write_str(s)
    }
}

/// Which end of a negotiation a candidate comes from or goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Participant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("cannot {action} while negotiation is {state}")]
    InvalidTransition {
        state: NegotiationState,
        action: SignalAction,
    },
    #[error("no negotiation with {0}")]
    UnknownPeer(UserId),
    #[error("invalid signal: {0}")]
    InvalidPayload(String),
}

#[derive(Debug)]
struct Negotiation {
    state: NegotiationState,
    for_host: Vec<IceCandidate>,
    for_participant: Vec<IceCandidate>,
}

impl Negotiation {
    fn new() -> Self {
        Self {
            state: NegotiationState::Idle,
            for_host: Vec::new(),
            for_participant: Vec::new(),
        }
    }

    fn transition(&mut self, action: SignalAction) -> Result<(), SignalError> {
        use NegotiationState::*;

        let next = match (self.state, action) {
            (Idle | Offering | Connected | Disconnected, SignalAction::Offer) => Offering,
            (Offering, SignalAction::Answer) => Answering,
            (Answering | Connected, SignalAction::Connect) => Connected,
            (state @ (Offering | Answering | Connected), SignalAction::IceCandidate) => state,
            (state, action) => return Err(SignalError::InvalidTransition { state, action }),
        };

        if action == SignalAction::Offer {
            self.for_host.clear();
            self.for_participant.clear();
        }
        self.state = next;
        Ok(())
    }
}

/// Checks a description before it is stored or relayed.
pub fn validate_description(
    description: &SessionDescription,
    expected: SdpType,
) -> Result<(), SignalError> {
    if description.kind != expected {
        return Err(SignalError::InvalidPayload(format!(
            "expected type {expected}, got {}",
            description.kind
        )));
    }
    if description.sdp.trim().is_empty() {
        return Err(SignalError::InvalidPayload("sdp is empty".to_owned()));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct Signaling {
    sessions: HashMap<SessionId, HashMap<UserId, Negotiation>>,
}

impl Signaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure `peer` has a negotiation. An existing one is left as is.
    pub fn open(&mut self, session_id: &str, peer: &str) {
        self.sessions
            .entry(session_id.to_owned())
            .or_default()
            .entry(peer.to_owned())
            .or_insert_with(Negotiation::new);
    }

    pub fn state(&self, session_id: &str, peer: &str) -> Option<NegotiationState> {
        self.sessions
            .get(session_id)
            .and_then(|peers| peers.get(peer))
            .map(|negotiation| negotiation.state)
    }

    pub fn offer(&mut self, session_id: &str, peer: &str) -> Result<(), SignalError> {
        self.negotiation_mut(session_id, peer)?
            .transition(SignalAction::Offer)
    }

    pub fn answer(&mut self, session_id: &str, peer: &str) -> Result<(), SignalError> {
        self.negotiation_mut(session_id, peer)?
            .transition(SignalAction::Answer)
    }

    /// Returns true when the negotiation was not already connected.
    pub fn connect(&mut self, session_id: &str, peer: &str) -> Result<bool, SignalError> {
        let negotiation = self.negotiation_mut(session_id, peer)?;
        let was_connected = negotiation.state == NegotiationState::Connected;
        negotiation.transition(SignalAction::Connect)?;
        Ok(!was_connected)
    }

    pub fn add_candidate(
        &mut self,
        session_id: &str,
        peer: &str,
        from: Side,
        candidate: IceCandidate,
    ) -> Result<(), SignalError> {
        if candidate.candidate.trim().is_empty() {
            return Err(SignalError::InvalidPayload("candidate is empty".to_owned()));
        }

        let negotiation = self.negotiation_mut(session_id, peer)?;
        negotiation.transition(SignalAction::IceCandidate)?;
        match from {
            Side::Host => negotiation.for_participant.push(candidate),
            Side::Participant => negotiation.for_host.push(candidate),
        }
        Ok(())
    }

    /// Hands over the candidates queued for one side and forgets them.
    pub fn take_candidates(
        &mut self,
        session_id: &str,
        peer: &str,
        to: Side,
    ) -> Result<Vec<IceCandidate>, SignalError> {
        let negotiation = self.negotiation_mut(session_id, peer)?;
        Ok(match to {
            Side::Host => mem::take(&mut negotiation.for_host),
            Side::Participant => mem::take(&mut negotiation.for_participant),
        })
    }

    pub fn disconnect(&mut self, session_id: &str, peer: &str) {
        if let Some(negotiation) = self
            .sessions
            .get_mut(session_id)
            .and_then(|peers| peers.get_mut(peer))
        {
            negotiation.state = NegotiationState::Disconnected;
            negotiation.for_host.clear();
            negotiation.for_participant.clear();
        }
    }

    pub fn close(&mut self, session_id: &str, peer: &str) {
        if let Some(peers) = self.sessions.get_mut(session_id) {
            peers.remove(peer);
            if peers.is_empty() {
                self.sessions.remove(session_id);
            }
        }
    }

    pub fn close_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    fn negotiation_mut(&mut self, session_id: &str, peer: &str) -> Result<&mut Negotiation, SignalError> {
        self.sessions
            .get_mut(session_id)
            .and_then(|peers| peers.get_mut(peer))
            .ok_or_else(|| SignalError::UnknownPeer(peer.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(s: &str) -> IceCandidate {
        IceCandidate {
            candidate: s.to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn full_handshake_reaches_connected() {
        let mut signaling = Signaling::new();
        signaling.open("s1", "p");
        assert_eq!(signaling.state("s1", "p"), Some(NegotiationState::Idle));

        signaling.offer("s1", "p").unwrap();
        signaling.answer("s1", "p").unwrap();
        assert_eq!(signaling.state("s1", "p"), Some(NegotiationState::Answering));

        assert!(signaling.connect("s1", "p").unwrap());
        assert!(!signaling.connect("s1", "p").unwrap());
        assert_eq!(signaling.state("s1", "p"), Some(NegotiationState::Connected));
    }

    #[test]
    fn answer_without_offer_is_rejected() {
        let mut signaling = Signaling::new();
        signaling.open("s1", "p");

        assert_eq!(
            signaling.answer("s1", "p"),
            Err(SignalError::InvalidTransition {
                state: NegotiationState::Idle,
                action: SignalAction::Answer,
            })
        );
    }

    #[test]
    fn offer_is_refused_mid_handshake_but_allowed_after_connect() {
        let mut signaling = Signaling::new();
        signaling.open("s1", "p");
        signaling.offer("s1", "p").unwrap();
        signaling.answer("s1", "p").unwrap();

        assert!(matches!(
            signaling.offer("s1", "p"),
            Err(SignalError::InvalidTransition { state: NegotiationState::Answering, .. })
        ));

        signaling.connect("s1", "p").unwrap();
        signaling.offer("s1", "p").unwrap();
        assert_eq!(signaling.state("s1", "p"), Some(NegotiationState::Offering));
    }

    #[test]
    fn candidates_queue_per_direction() {
        let mut signaling = Signaling::new();
        signaling.open("s1", "p");

        assert!(signaling
            .add_candidate("s1", "p", Side::Participant, candidate("early"))
            .is_err());

        signaling.offer("s1", "p").unwrap();
        signaling
            .add_candidate("s1", "p", Side::Participant, candidate("from-p"))
            .unwrap();
        signaling
            .add_candidate("s1", "p", Side::Host, candidate("from-h"))
            .unwrap();

        let for_host = signaling.take_candidates("s1", "p", Side::Host).unwrap();
        assert_eq!(for_host, vec![candidate("from-p")]);
        assert!(signaling.take_candidates("s1", "p", Side::Host).unwrap().is_empty());
        assert_eq!(
            signaling.take_candidates("s1", "p", Side::Participant).unwrap(),
            vec![candidate("from-h")]
        );
    }

    #[test]
    fn disconnect_allows_a_fresh_offer() {
        let mut signaling = Signaling::new();
        signaling.open("s1", "p");
        signaling.offer("s1", "p").unwrap();
        signaling.disconnect("s1", "p");

        assert_eq!(signaling.state("s1", "p"), Some(NegotiationState::Disconnected));
        assert!(signaling.connect("s1", "p").is_err());
        signaling.offer("s1", "p").unwrap();
    }

    #[test]
    fn descriptions_need_matching_type_and_sdp() {
        let offer = SessionDescription {
            kind: SdpType::Offer,
            sdp: "v=0\r\n".to_owned(),
        };
        assert!(validate_description(&offer, SdpType::Offer).is_ok());
        assert!(validate_description(&offer, SdpType::Answer).is_err());

        let blank = SessionDescription {
            kind: SdpType::Offer,
            sdp: "  ".to_owned(),
        };
        assert!(matches!(
            validate_description(&blank, SdpType::Offer),
            Err(SignalError::InvalidPayload(_))
        ));
    }

    #[test]
    fn unknown_peer_is_reported() {
        let mut signaling = Signaling::new();
        assert_eq!(
            signaling.offer("s1", "ghost"),
            Err(SignalError::UnknownPeer("ghost".to_owned()))
        );
    }
}
