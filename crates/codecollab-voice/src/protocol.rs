//! Signaling payloads and store layout for voice chat.
//!
//! Signals ride inside a [`SignalEnvelope`] appended to the recipient's
//! mailbox in the realtime store. The store path layout lives in
//! [`paths`] so every component agrees on where things are kept.

use codecollab_common::{now_millis, ParticipantId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// WebRTC negotiation payloads exchanged between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    /// SDP offer to establish a peer connection.
    Offer { sdp: String },
    /// SDP answer in response to an offer.
    Answer { sdp: String },
    /// ICE candidate for NAT traversal.
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u32>,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::IceCandidate { .. } => SignalKind::IceCandidate,
        }
    }

    pub fn is_offer(&self) -> bool {
        matches!(self, SignalPayload::Offer { .. })
    }
}

/// Discriminant of a [`SignalPayload`], duplicated on the envelope so
/// mailbox readers can route without decoding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// One negotiation message from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub kind: SignalKind,
    pub payload: SignalPayload,
    /// Sender wall clock, epoch millis.
    pub timestamp: i64,
}

impl SignalEnvelope {
    pub fn new(from: ParticipantId, to: ParticipantId, payload: SignalPayload) -> Self {
        Self {
            from,
            to,
            kind: payload.kind(),
            payload,
            timestamp: now_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store layout
// ---------------------------------------------------------------------------

/// Store paths used by the voice subsystem. Everything is scoped per room.
pub mod paths {
    use codecollab_common::ParticipantId;

    /// Mailbox holding signals addressed to `participant`.
    pub fn mailbox(room_id: &str, participant: &ParticipantId) -> String {
        format!("rooms/{room_id}/signals/{participant}")
    }

    /// Parent of every heartbeat record in a room.
    pub fn heartbeats(room_id: &str) -> String {
        format!("rooms/{room_id}/heartbeat")
    }

    /// Heartbeat record of a single participant.
    pub fn heartbeat(room_id: &str, participant: &ParticipantId) -> String {
        format!("rooms/{room_id}/heartbeat/{participant}")
    }

    /// Published mute flag of a single participant.
    pub fn mute(room_id: &str, participant: &ParticipantId) -> String {
        format!("rooms/{room_id}/mute/{participant}")
    }
}
