//! The task that owns a session's voice state.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use codecollab_common::ParticipantId;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::types::{emit, FrameSource, SessionCommand, SessionConfig, VoiceEvent};
use crate::heartbeat::Heartbeat;
use crate::media::LocalMedia;
use crate::peer::{LinkNotice, PeerManager};
use crate::protocol::{paths, SignalEnvelope};
use crate::signaling::SignalingChannel;
use crate::store::KvStore;

const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Frame clock
// ---------------------------------------------------------------------------

enum FrameClock {
    Timer(Interval),
    External(mpsc::Receiver<()>),
    Stopped,
}

impl FrameClock {
    fn new(source: FrameSource, period: Duration) -> Self {
        match source {
            FrameSource::Interval => {
                let mut timer = tokio::time::interval(period.max(Duration::from_millis(1)));
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                FrameClock::Timer(timer)
            }
            FrameSource::External(rx) => FrameClock::External(rx),
        }
    }

    async fn tick(&mut self) {
        match self {
            FrameClock::Timer(timer) => {
                timer.tick().await;
            }
            FrameClock::External(rx) => {
                if rx.recv().await.is_some() {
                    return;
                }
                *self = FrameClock::Stopped;
                future::pending::<()>().await;
            }
            FrameClock::Stopped => future::pending::<()>().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub(crate) struct Driver {
    config: SessionConfig,
    store: Arc<dyn KvStore>,
    signaling: Arc<dyn SignalingChannel>,
    media: LocalMedia,
    peers: PeerManager,
    heartbeat: Option<Heartbeat>,
    event_tx: mpsc::Sender<VoiceEvent>,
}

impl Driver {
    pub(crate) fn new(
        config: SessionConfig,
        store: Arc<dyn KvStore>,
        signaling: Arc<dyn SignalingChannel>,
        media: LocalMedia,
        peers: PeerManager,
        heartbeat: Heartbeat,
        event_tx: mpsc::Sender<VoiceEvent>,
    ) -> Self {
        Self {
            config,
            store,
            signaling,
            media,
            peers,
            heartbeat: Some(heartbeat),
            event_tx,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut signals: mpsc::Receiver<SignalEnvelope>,
        mut links: mpsc::UnboundedReceiver<LinkNotice>,
        mut roster: watch::Receiver<Vec<ParticipantId>>,
        frames: FrameSource,
    ) {
        let mut frames = FrameClock::new(frames, self.config.voice.frame_interval());
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut signals_open = true;
        let mut roster_open = true;

        let initial = roster.borrow_and_update().clone();
        self.peers.sync_roster(&initial).await;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Leave { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("All voice handles dropped");
                        break;
                    }
                },
                envelope = signals.recv(), if signals_open => match envelope {
                    Some(envelope) => {
                        let from = envelope.from.clone();
                        self.peers.handle_incoming_signal(&from, envelope).await;
                    }
                    None => {
                        warn!(room = %self.config.room_id, "Signal stream ended");
                        signals_open = false;
                    }
                },
                Some(notice) = links.recv() => {
                    self.peers.handle_link_event(notice).await;
                }
                changed = roster.changed(), if roster_open => match changed {
                    Ok(()) => {
                        let ids = roster.borrow_and_update().clone();
                        self.peers.sync_roster(&ids).await;
                    }
                    Err(_) => {
                        debug!(room = %self.config.room_id, "Roster provider gone");
                        roster_open = false;
                    }
                },
                _ = frames.tick() => {
                    let local = self.media.sample_speaking();
                    self.peers.sample_frame(local).await;
                }
                _ = maintenance.tick() => {
                    let now = Instant::now();
                    self.peers.expire_stalled(now).await;
                    let reaped = self.peers.reap_closed(now).await;
                    if !reaped.is_empty() {
                        debug!(reaped = reaped.len(), "Reaped closed peers");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SetMuted { muted, reply } => {
                if self.media.set_muted(muted) {
                    self.mute_changed(muted).await;
                }
                let _ = reply.send(self.media.is_muted());
            }
            SessionCommand::ToggleMute { reply } => {
                let muted = self.media.toggle_mute();
                self.mute_changed(muted).await;
                let _ = reply.send(muted);
            }
            SessionCommand::IsMuted { reply } => {
                let _ = reply.send(self.media.is_muted());
            }
            SessionCommand::Peers { reply } => {
                let _ = reply.send(self.peers.peers());
            }
            SessionCommand::Speaking { reply } => {
                let _ = reply.send(self.peers.speaking().snapshot());
            }
            SessionCommand::LocalStream { reply } => {
                let _ = reply.send(self.media.stream().cloned());
            }
            SessionCommand::ReacquireMedia { reply } => {
                let result = match self.media.reacquire().await {
                    Ok(stream) => {
                        self.peers.replace_local_stream(Some(stream)).await;
                        emit(&self.event_tx, VoiceEvent::MediaReady);
                        Ok(())
                    }
                    Err(e) => {
                        warn!(error = %e, "Microphone reacquire failed");
                        self.peers.replace_local_stream(None).await;
                        emit(&self.event_tx, VoiceEvent::MediaUnavailable(e.to_string()));
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            SessionCommand::Leave { .. } => {}
        }
    }

    /// Mute changes run here, one at a time, so rapid toggles always
    /// settle on the last requested state.
    async fn mute_changed(&mut self, muted: bool) {
        // Commit right away so the local entry never reads speaking while muted.
        let local = self.media.sample_speaking();
        self.peers.sample_frame(local).await;

        let path = paths::mute(&self.config.room_id, &self.config.local_id);
        if let Err(e) = self.store.write(&path, json!(muted)).await {
            warn!(error = %e, "Failed to publish mute state");
            emit(
                &self.event_tx,
                VoiceEvent::Error(format!("mute state not published: {e}")),
            );
        }
        emit(&self.event_tx, VoiceEvent::MuteChanged(muted));
    }

    async fn shutdown(&mut self) {
        let room = self.config.room_id.clone();
        let me = self.config.local_id.clone();

        if let Err(e) = self.signaling.unsubscribe(&me).await {
            warn!(room = %room, error = %e, "Failed to clear mailbox");
        }
        self.peers.teardown_all().await;
        self.media.teardown();
        if let Some(heartbeat) = self.heartbeat.take() {
            if let Err(e) = heartbeat.stop().await {
                warn!(room = %room, error = %e, "Failed to remove heartbeat");
            }
        }
        if let Err(e) = self.store.remove(&paths::mute(&room, &me)).await {
            warn!(room = %room, error = %e, "Failed to clear mute state");
        }
        info!(room = %room, participant = %me, "Voice session ended");
    }
}
