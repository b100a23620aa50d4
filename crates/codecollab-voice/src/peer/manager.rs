//! Peer connection manager.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use codecollab_common::ParticipantId;
use codecollab_config::VoiceConfig;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::election::should_initiate;
use super::error::{classify, LinkError, Severity};
use super::transport::{LinkEvent, LinkNotice, LinkParams, PeerLink, PeerTransport};
use super::types::{CloseReason, EnsureOutcome, IceConnectionState, PeerInfo, PeerState, Role};
use crate::media::{LevelMeter, MediaDevices, MediaStream};
use crate::protocol::{SignalEnvelope, SignalPayload};
use crate::session::{emit, VoiceEvent};
use crate::signaling::SignalingChannel;
use crate::speaking::SpeakingState;

// ---------------------------------------------------------------------------
// Per-peer entry
// ---------------------------------------------------------------------------

/// Every resource held for one remote participant.
struct PeerEntry {
    role: Role,
    state: PeerState,
    generation: u64,
    link: Option<Box<dyn PeerLink>>,
    remote_stream: Option<MediaStream>,
    meter: Option<LevelMeter>,
    opened_at: Instant,
    closed_at: Option<Instant>,
}

impl PeerEntry {
    fn is_live(&self) -> bool {
        self.state != PeerState::Closed
    }

    fn ice_state(&self) -> IceConnectionState {
        self.link
            .as_ref()
            .map_or(IceConnectionState::Closed, |l| l.ice_state())
    }

    /// Release the link, analyser and remote tracks. Idempotent.
    fn release(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.destroy();
        }
        if let Some(mut meter) = self.meter.take() {
            meter.close();
        }
        if let Some(stream) = self.remote_stream.take() {
            stream.stop_all();
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the link to every remote participant.
///
/// Not shared: the session driver calls into it one event at a time.
pub struct PeerManager {
    local_id: ParticipantId,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<dyn SignalingChannel>,
    devices: Arc<dyn MediaDevices>,
    ice_servers: Vec<String>,
    fft_size: u32,
    threshold: u8,
    close_grace: Duration,
    negotiation_timeout: Option<Duration>,
    max_peers: usize,
    local_stream: Option<MediaStream>,
    peers: HashMap<ParticipantId, PeerEntry>,
    roster: HashSet<ParticipantId>,
    speaking: SpeakingState,
    next_generation: u64,
    link_tx: mpsc::UnboundedSender<LinkNotice>,
    event_tx: mpsc::Sender<VoiceEvent>,
}

impl PeerManager {
    /// Create a manager. Link events arrive on the returned receiver and
    /// must be fed back through [`handle_link_event`](Self::handle_link_event).
    pub fn new(
        local_id: ParticipantId,
        config: &VoiceConfig,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        event_tx: mpsc::Sender<VoiceEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkNotice>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id,
            transport,
            signaling,
            devices,
            ice_servers: config.ice_servers.clone(),
            fft_size: config.fft_size,
            threshold: config.speaking_threshold,
            close_grace: config.close_grace(),
            negotiation_timeout: config.negotiation_timeout(),
            max_peers: config.max_peers,
            local_stream: None,
            peers: HashMap::new(),
            roster: HashSet::new(),
            speaking: SpeakingState::new(),
            next_generation: 0,
            link_tx,
            event_tx,
        };
        (manager, link_rx)
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn speaking(&self) -> &SpeakingState {
        &self.speaking
    }

    /// Peers that are negotiating or connected.
    pub fn live_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_live()).count()
    }

    /// Remote streams currently attached.
    pub fn remote_stream_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.remote_stream.is_some())
            .count()
    }

    pub fn peer_state(&self, peer: &ParticipantId) -> Option<PeerState> {
        self.peers.get(peer).map(|p| p.state)
    }

    /// Snapshot of every entry, tombstones included, ordered by id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|(id, p)| PeerInfo {
                peer_id: id.clone(),
                role: p.role,
                state: p.state,
                has_remote_stream: p.remote_stream.is_some(),
            })
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    // -- Connection lifecycle ----------------------------------------------

    /// Make sure a link to `peer` exists or is expected. Idempotent.
    pub async fn ensure_connection(&mut self, peer: &ParticipantId) -> EnsureOutcome {
        if *peer == self.local_id {
            return EnsureOutcome::Deferred;
        }
        if let Some(entry) = self.peers.get(peer) {
            if entry.is_live() {
                return EnsureOutcome::Existing;
            }
            trace!(peer = %peer, "Peer closed recently; not re-initiating during grace");
            return EnsureOutcome::Deferred;
        }
        if !should_initiate(&self.local_id, peer) {
            return EnsureOutcome::AwaitingOffer;
        }
        if self.local_stream.is_none() {
            debug!(peer = %peer, "No local stream; not initiating");
            return EnsureOutcome::Deferred;
        }
        if self.live_count() >= self.max_peers {
            warn!(peer = %peer, max_peers = self.max_peers, "Peer limit reached; not initiating");
            return EnsureOutcome::Deferred;
        }
        match self.open_link(peer, Role::Initiator).await {
            Ok(()) => EnsureOutcome::Initiated,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to open link");
                EnsureOutcome::Deferred
            }
        }
    }

    async fn open_link(&mut self, peer: &ParticipantId, role: Role) -> Result<(), LinkError> {
        let Some(local_stream) = self.local_stream.clone() else {
            return Ok(());
        };
        self.next_generation += 1;
        let generation = self.next_generation;
        let params = LinkParams {
            local_id: self.local_id.clone(),
            remote_id: peer.clone(),
            role,
            local_stream,
            ice_servers: self.ice_servers.clone(),
            generation,
        };
        let link = self.transport.open(params, self.link_tx.clone())?;

        if let Some(mut stale) = self.peers.insert(
            peer.clone(),
            PeerEntry {
                role,
                state: PeerState::Negotiating,
                generation,
                link: Some(link),
                remote_stream: None,
                meter: None,
                opened_at: Instant::now(),
                closed_at: None,
            },
        ) {
            stale.release();
        }
        info!(peer = %peer, role = %role, generation, "Negotiating");
        emit(
            &self.event_tx,
            VoiceEvent::PeerConnecting {
                peer: peer.clone(),
                role,
            },
        );
        Ok(())
    }

    /// Apply a signal received from `from`.
    ///
    /// An offer from a peer without a live entry creates a responder,
    /// replacing any tombstone. Answers and candidates for peers without
    /// a live entry are stale and dropped.
    pub async fn handle_incoming_signal(&mut self, from: &ParticipantId, envelope: SignalEnvelope) {
        if envelope.to != self.local_id || envelope.from != *from {
            warn!(from = %from, to = %envelope.to, "Misaddressed signal dropped");
            return;
        }
        let mut live = self.peers.get(from).is_some_and(PeerEntry::is_live);

        // A new offer over a transport that already died starts over.
        let dead_link = self
            .peers
            .get(from)
            .is_some_and(|p| p.ice_state().is_terminal());
        if live && dead_link && envelope.payload.is_offer() {
            self.close_peer(from, CloseReason::Remote).await;
            live = false;
        }

        if !live {
            if !envelope.payload.is_offer() {
                debug!(peer = %from, kind = ?envelope.kind, "Stale signal dropped");
                return;
            }
            if self.local_stream.is_none() {
                debug!(peer = %from, "No local stream; ignoring offer");
                return;
            }
            if self.live_count() >= self.max_peers {
                warn!(peer = %from, max_peers = self.max_peers, "Peer limit reached; ignoring offer");
                return;
            }
            if let Err(e) = self.open_link(from, Role::Responder).await {
                warn!(peer = %from, error = %e, "Failed to open responder link");
                return;
            }
        }

        self.apply_signal(from, envelope.payload).await;
    }

    async fn apply_signal(&mut self, peer: &ParticipantId, payload: SignalPayload) {
        let Some(link) = self.peers.get_mut(peer).and_then(|p| p.link.as_mut()) else {
            return;
        };
        if let Err(err) = link.signal(payload) {
            self.handle_link_error(peer, err).await;
        }
    }

    async fn handle_link_error(&mut self, peer: &ParticipantId, err: LinkError) {
        let Some(entry) = self.peers.get(peer) else {
            return;
        };
        let ice = entry.ice_state();
        match classify(&err, ice) {
            Severity::Benign => {
                debug!(peer = %peer, ?ice, error = %err, "Benign link error ignored");
            }
            Severity::Fatal => {
                warn!(peer = %peer, ?ice, error = %err, "Fatal link error");
                self.close_peer(peer, CloseReason::Fatal(err.message)).await;
            }
        }
    }

    /// Process one event reported by a link.
    pub async fn handle_link_event(&mut self, notice: LinkNotice) {
        let LinkNotice {
            peer,
            generation,
            event,
        } = notice;
        let current = self
            .peers
            .get(&peer)
            .is_some_and(|p| p.generation == generation && p.is_live());
        if !current {
            trace!(peer = %peer, generation, "Event from retired link ignored");
            return;
        }

        match event {
            LinkEvent::Signal(payload) => {
                let envelope = SignalEnvelope::new(self.local_id.clone(), peer.clone(), payload);
                if let Err(e) = self.signaling.send(&peer, &envelope).await {
                    warn!(peer = %peer, kind = ?envelope.kind, error = %e, "Failed to send signal");
                    emit(
                        &self.event_tx,
                        VoiceEvent::Error(format!("signal to {peer} not delivered: {e}")),
                    );
                }
            }
            LinkEvent::Stream(stream) => self.attach_stream(&peer, stream).await,
            LinkEvent::Error(err) => self.handle_link_error(&peer, err).await,
            LinkEvent::IceStateChanged(state) => {
                if state.is_terminal() {
                    self.close_peer(&peer, CloseReason::IceFailed).await;
                } else {
                    debug!(peer = %peer, ?state, "ICE state changed");
                }
            }
            LinkEvent::Close => self.close_peer(&peer, CloseReason::Remote).await,
        }
    }

    async fn attach_stream(&mut self, peer: &ParticipantId, stream: MediaStream) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        if entry.remote_stream.as_ref() == Some(&stream) {
            return;
        }
        if let Some(mut meter) = entry.meter.take() {
            meter.close();
        }
        if let Some(old) = entry.remote_stream.take() {
            old.stop_all();
        }

        match self.devices.create_analyser(&stream, self.fft_size) {
            Ok(analyser) => entry.meter = Some(LevelMeter::new(analyser, self.threshold)),
            Err(e) => warn!(peer = %peer, error = %e, "Speaking detection unavailable for peer"),
        }
        entry.remote_stream = Some(stream.clone());
        entry.state = PeerState::Connected;

        info!(peer = %peer, role = %entry.role, stream = %stream.id(), "Peer connected");
        emit(
            &self.event_tx,
            VoiceEvent::PeerConnected {
                peer: peer.clone(),
                stream,
            },
        );
    }

    /// Close `peer`, release its resources and leave a tombstone.
    async fn close_peer(&mut self, peer: &ParticipantId, reason: CloseReason) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        if !entry.is_live() {
            return;
        }
        entry.release();
        entry.state = PeerState::Closed;
        entry.closed_at = Some(Instant::now());
        self.speaking.remove(peer);

        info!(peer = %peer, reason = %reason, "Peer closed");
        emit(
            &self.event_tx,
            VoiceEvent::PeerDisconnected {
                peer: peer.clone(),
                reason,
            },
        );
    }

    /// Close `peer` and forget it entirely.
    pub async fn teardown(&mut self, peer: &ParticipantId) {
        self.close_peer(peer, CloseReason::LocalTeardown).await;
        if let Some(mut entry) = self.peers.remove(peer) {
            entry.release();
        }
        self.speaking.remove(peer);
    }

    /// Tear down every peer. Only the local speaking entry survives.
    pub async fn teardown_all(&mut self) {
        let ids: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        for id in ids {
            self.teardown(&id).await;
        }
        let keep: HashSet<ParticipantId> = [self.local_id.clone()].into_iter().collect();
        self.speaking.retain_only(&keep);
    }

    /// Adopt a new roster: peers that left are torn down, everyone
    /// present is re-elected.
    pub async fn sync_roster(&mut self, roster: &[ParticipantId]) {
        let next: HashSet<ParticipantId> = roster
            .iter()
            .filter(|id| **id != self.local_id)
            .cloned()
            .collect();

        let departed: Vec<ParticipantId> = self
            .peers
            .keys()
            .filter(|id| !next.contains(*id))
            .cloned()
            .collect();
        for id in departed {
            debug!(peer = %id, "Peer left roster");
            self.teardown(&id).await;
        }

        let mut present: Vec<ParticipantId> = next.iter().cloned().collect();
        present.sort();
        self.roster = next;
        for id in present {
            let outcome = self.ensure_connection(&id).await;
            trace!(peer = %id, ?outcome, "Roster election");
        }
    }

    /// Use `stream` as the local stream. Every existing link was built on
    /// the old stream, so all of them are rebuilt.
    pub async fn replace_local_stream(&mut self, stream: Option<MediaStream>) {
        if self.local_stream == stream {
            return;
        }
        self.local_stream = stream;
        if !self.peers.is_empty() {
            info!(peers = self.peers.len(), "Local stream replaced; rebuilding links");
            self.teardown_all().await;
        }
        let roster: Vec<ParticipantId> = self.roster.iter().cloned().collect();
        self.sync_roster(&roster).await;
    }

    // -- Maintenance --------------------------------------------------------

    /// Drop tombstones whose grace delay has passed and re-run election
    /// for the ones still in the roster. Returns the reaped ids.
    pub async fn reap_closed(&mut self, now: Instant) -> Vec<ParticipantId> {
        let grace = self.close_grace;
        let mut reaped: Vec<ParticipantId> = self
            .peers
            .iter()
            .filter(|(_, p)| {
                p.closed_at
                    .is_some_and(|closed_at| now.saturating_duration_since(closed_at) >= grace)
            })
            .map(|(id, _)| id.clone())
            .collect();
        reaped.sort();

        for id in &reaped {
            if let Some(mut entry) = self.peers.remove(id) {
                entry.release();
            }
        }
        for id in &reaped {
            if self.roster.contains(id) {
                let outcome = self.ensure_connection(id).await;
                debug!(peer = %id, ?outcome, "Re-elected after grace");
            }
        }
        reaped
    }

    /// Force-close peers stuck negotiating past the deadline.
    pub async fn expire_stalled(&mut self, now: Instant) {
        let Some(timeout) = self.negotiation_timeout else {
            return;
        };
        let stalled: Vec<ParticipantId> = self
            .peers
            .iter()
            .filter(|(_, p)| {
                p.state == PeerState::Negotiating
                    && now.saturating_duration_since(p.opened_at) >= timeout
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stalled {
            warn!(peer = %id, timeout_secs = timeout.as_secs(), "Negotiation timed out");
            self.close_peer(&id, CloseReason::NegotiationTimeout).await;
        }
    }

    /// Sample every connected peer plus the local sample, commit them in
    /// one batch and report what changed.
    pub async fn sample_frame(&mut self, local: Option<bool>) {
        let mut samples: Vec<(ParticipantId, bool)> = self
            .peers
            .iter_mut()
            .filter(|(_, p)| p.state == PeerState::Connected)
            .filter_map(|(id, p)| p.meter.as_mut().map(|m| (id.clone(), m.is_speaking())))
            .collect();
        if let Some(speaking) = local {
            samples.push((self.local_id.clone(), speaking));
        }

        for (participant, speaking) in self.speaking.commit(samples) {
            emit(
                &self.event_tx,
                VoiceEvent::SpeakingChanged {
                    participant,
                    speaking,
                },
            );
        }
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        for entry in self.peers.values_mut() {
            entry.release();
        }
    }
}
