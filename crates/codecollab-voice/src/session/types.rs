//! Session configuration, events, and driver commands.

use std::collections::BTreeMap;
use std::time::Duration;

use codecollab_common::ParticipantId;
use codecollab_config::{CodeCollabConfig, VoiceConfig};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::media::{MediaError, MediaStream};
use crate::peer::{CloseReason, PeerInfo, Role};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: String,
    pub local_id: ParticipantId,
    pub voice: VoiceConfig,
    pub heartbeat_interval: Duration,
}

impl SessionConfig {
    pub fn new(
        room_id: impl Into<String>,
        local_id: ParticipantId,
        config: &CodeCollabConfig,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            local_id,
            voice: config.voice.clone(),
            heartbeat_interval: config.heartbeat.interval(),
        }
    }
}

/// What paces speaking detection.
#[derive(Debug)]
pub enum FrameSource {
    /// A timer at `voice.frame_interval_ms`.
    Interval,
    /// One frame per message, e.g. from the host's repaint loop.
    External(mpsc::Receiver<()>),
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events emitted to the host UI.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// The microphone is open.
    MediaReady,
    /// The microphone could not be opened; voice is off for this client.
    MediaUnavailable(String),
    MuteChanged(bool),
    PeerConnecting {
        peer: ParticipantId,
        role: Role,
    },
    PeerConnected {
        peer: ParticipantId,
        stream: MediaStream,
    },
    PeerDisconnected {
        peer: ParticipantId,
        reason: CloseReason,
    },
    SpeakingChanged {
        participant: ParticipantId,
        speaking: bool,
    },
    Error(String),
}

/// Queue `event` for the host without waiting. When the host has
/// stopped draining its receiver the event is dropped.
pub(crate) fn emit(tx: &mpsc::Sender<VoiceEvent>, event: VoiceEvent) {
    match tx.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => debug!(?event, "Event queue full; event dropped"),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Requests from [`VoiceHandle`](super::VoiceHandle) to the driver.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<bool>,
    },
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    IsMuted {
        reply: oneshot::Sender<bool>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Speaking {
        reply: oneshot::Sender<BTreeMap<ParticipantId, bool>>,
    },
    LocalStream {
        reply: oneshot::Sender<Option<MediaStream>>,
    },
    ReacquireMedia {
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}
