//! Session setup and the public handle.

use std::collections::BTreeMap;
use std::sync::Arc;

use codecollab_common::ParticipantId;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use super::driver::Driver;
use super::types::{emit, FrameSource, SessionCommand, SessionConfig, VoiceEvent};
use crate::error::VoiceError;
use crate::heartbeat::Heartbeat;
use crate::media::{LocalMedia, MediaDevices, MediaStream};
use crate::peer::{PeerInfo, PeerManager, PeerTransport};
use crate::protocol::paths;
use crate::signaling::{MailboxChannel, SignalingChannel};
use crate::store::KvStore;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Collaborators for one participant's voice session.
pub struct VoiceSession {
    config: SessionConfig,
    store: Arc<dyn KvStore>,
    devices: Arc<dyn MediaDevices>,
    transport: Arc<dyn PeerTransport>,
    signaling: Option<Arc<dyn SignalingChannel>>,
}

impl VoiceSession {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn KvStore>,
        devices: Arc<dyn MediaDevices>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            config,
            store,
            devices,
            transport,
            signaling: None,
        }
    }

    /// Signal through `channel` instead of the store mailbox.
    pub fn with_signaling(mut self, channel: Arc<dyn SignalingChannel>) -> Self {
        self.signaling = Some(channel);
        self
    }

    /// Join voice for the room.
    ///
    /// A microphone failure does not fail the call: it is reported once as
    /// [`VoiceEvent::MediaUnavailable`] and the session runs without voice.
    pub async fn start(
        self,
        roster: watch::Receiver<Vec<ParticipantId>>,
        frames: FrameSource,
    ) -> Result<(VoiceHandle, mpsc::Receiver<VoiceEvent>), VoiceError> {
        let VoiceSession {
            config,
            store,
            devices,
            transport,
            signaling,
        } = self;
        let (event_tx, event_rx) = mpsc::channel(256);
        let local_id = config.local_id.clone();
        let room_id = config.room_id.clone();

        let signaling: Arc<dyn SignalingChannel> = match signaling {
            Some(channel) => channel,
            None => Arc::new(MailboxChannel::new(Arc::clone(&store), room_id.clone())),
        };

        // Microphone first, so the stream exists before any offer is handled.
        let mut media = LocalMedia::new(Arc::clone(&devices), &config.voice);
        let mut stream = None;
        if config.voice.enabled {
            match media.acquire().await {
                Ok(s) => {
                    stream = Some(s);
                    emit(&event_tx, VoiceEvent::MediaReady);
                }
                Err(e) => {
                    warn!(room = %room_id, error = %e, "Microphone unavailable; continuing without voice");
                    emit(&event_tx, VoiceEvent::MediaUnavailable(e.to_string()));
                }
            }
        } else {
            info!(room = %room_id, "Voice disabled by config");
        }

        if let Err(e) = store
            .write(&paths::mute(&room_id, &local_id), json!(media.is_muted()))
            .await
        {
            warn!(room = %room_id, error = %e, "Failed to publish mute state");
            emit(
                &event_tx,
                VoiceEvent::Error(format!("mute state not published: {e}")),
            );
        }

        let signals = signaling.subscribe(&local_id).await?;
        let heartbeat =
            Heartbeat::start(Arc::clone(&store), &room_id, &local_id, config.heartbeat_interval)
                .await?;

        let (mut peers, links) = PeerManager::new(
            local_id.clone(),
            &config.voice,
            transport,
            Arc::clone(&signaling),
            devices,
            event_tx.clone(),
        );
        peers.replace_local_stream(stream).await;

        let (command_tx, command_rx) = mpsc::channel(64);
        let driver = Driver::new(config, store, signaling, media, peers, heartbeat, event_tx);
        tokio::spawn(driver.run(command_rx, signals, links, roster, frames));

        info!(room = %room_id, participant = %local_id, "Voice session started");
        Ok((
            VoiceHandle {
                command_tx,
                local_id,
            },
            event_rx,
        ))
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running session. Cheap to clone; the session ends on
/// [`leave`](Self::leave) or when every handle is dropped.
#[derive(Clone)]
pub struct VoiceHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    local_id: ParticipantId,
}

impl VoiceHandle {
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| VoiceError::SessionClosed)?;
        rx.await.map_err(|_| VoiceError::SessionClosed)
    }

    /// Mute or unmute. Returns the resulting state.
    pub async fn set_muted(&self, muted: bool) -> Result<bool, VoiceError> {
        self.request(|reply| SessionCommand::SetMuted { muted, reply })
            .await
    }

    /// Flip mute. Returns the resulting state.
    pub async fn toggle_mute(&self) -> Result<bool, VoiceError> {
        self.request(|reply| SessionCommand::ToggleMute { reply }).await
    }

    pub async fn is_muted(&self) -> Result<bool, VoiceError> {
        self.request(|reply| SessionCommand::IsMuted { reply }).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, VoiceError> {
        self.request(|reply| SessionCommand::Peers { reply }).await
    }

    /// Current speaking flags, local participant included.
    pub async fn speaking(&self) -> Result<BTreeMap<ParticipantId, bool>, VoiceError> {
        self.request(|reply| SessionCommand::Speaking { reply }).await
    }

    pub async fn local_stream(&self) -> Result<Option<MediaStream>, VoiceError> {
        self.request(|reply| SessionCommand::LocalStream { reply })
            .await
    }

    /// Reopen the microphone on user request and rebuild every link on
    /// the new stream.
    pub async fn reacquire_media(&self) -> Result<(), VoiceError> {
        self.request(|reply| SessionCommand::ReacquireMedia { reply })
            .await?
            .map_err(VoiceError::from)
    }

    /// Leave the room. Returns once every resource is released.
    pub async fn leave(&self) -> Result<(), VoiceError> {
        self.request(|reply| SessionCommand::Leave { reply }).await
    }
}
