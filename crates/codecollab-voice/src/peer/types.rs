//! Per-peer state types.

use std::fmt;

use codecollab_common::ParticipantId;

/// Which side of a link opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Lifecycle of a peer entry. Absence from the manager is the fourth state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Negotiating,
    Connected,
    Closed,
}

/// ICE transport state as reported by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Media is flowing.
    pub fn is_healthy(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }

    /// The link will not recover on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, IceConnectionState::Failed | IceConnectionState::Closed)
    }
}

/// Why a peer entry was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The link reported it closed.
    Remote,
    /// ICE reached failed or closed.
    IceFailed,
    /// A non-benign link error.
    Fatal(String),
    /// Negotiation did not finish in time.
    NegotiationTimeout,
    /// Torn down locally (leave, roster change, stream replacement).
    LocalTeardown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Remote => write!(f, "closed by remote"),
            CloseReason::IceFailed => write!(f, "ICE failed"),
            CloseReason::Fatal(msg) => write!(f, "fatal error: {msg}"),
            CloseReason::NegotiationTimeout => write!(f, "negotiation timed out"),
            CloseReason::LocalTeardown => write!(f, "local teardown"),
        }
    }
}

/// Result of [`PeerManager::ensure_connection`](super::PeerManager::ensure_connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A live entry already exists.
    Existing,
    /// A new link was opened as initiator.
    Initiated,
    /// The remote side initiates; nothing to do until its offer arrives.
    AwaitingOffer,
    /// Not initiated now: no local stream, closed-peer grace, peer cap,
    /// or the link could not be opened.
    Deferred,
}

/// Snapshot of one peer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: ParticipantId,
    pub role: Role,
    pub state: PeerState,
    pub has_remote_stream: bool,
}
