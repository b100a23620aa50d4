use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use codecollab_common::ParticipantId;
use codecollab_config::VoiceConfig;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::*;
use crate::media::{MediaStream, SyntheticDevices};
use crate::protocol::{SignalEnvelope, SignalPayload};
use crate::session::VoiceEvent;
use crate::signaling::{SignalingChannel, SignalingError};
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Hands envelopes straight to the recipient's queue.
#[derive(Default)]
struct DirectSignaling {
    inboxes: Mutex<HashMap<ParticipantId, mpsc::Sender<SignalEnvelope>>>,
}

#[async_trait]
impl SignalingChannel for DirectSignaling {
    async fn send(&self, to: &ParticipantId, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        let tx = self.inboxes.lock().unwrap().get(to).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(envelope.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        me: &ParticipantId,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, SignalingError> {
        let (tx, rx) = mpsc::channel(256);
        self.inboxes.lock().unwrap().insert(me.clone(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, me: &ParticipantId) -> Result<(), SignalingError> {
        self.inboxes.lock().unwrap().remove(me);
        Ok(())
    }
}

struct Node {
    manager: PeerManager,
    links: mpsc::UnboundedReceiver<LinkNotice>,
    signals: mpsc::Receiver<SignalEnvelope>,
    events: mpsc::Receiver<VoiceEvent>,
}

impl Node {
    fn drain_events(&mut self) -> Vec<VoiceEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}

struct Mesh {
    devices: SyntheticDevices,
    network: LoopbackNetwork,
    signaling: Arc<DirectSignaling>,
    config: VoiceConfig,
}

impl Mesh {
    fn new() -> Self {
        Self::with_config(VoiceConfig::default())
    }

    fn with_config(config: VoiceConfig) -> Self {
        Self {
            devices: SyntheticDevices::new(),
            network: LoopbackNetwork::new(),
            signaling: Arc::new(DirectSignaling::default()),
            config,
        }
    }

    async fn node(&self, id: &str) -> Node {
        let (event_tx, events) = mpsc::channel(1024);
        let (mut manager, links) = PeerManager::new(
            id.into(),
            &self.config,
            Arc::new(self.network.clone()),
            self.signaling.clone(),
            Arc::new(self.devices.microphone(id)),
            event_tx,
        );
        let signals = self.signaling.subscribe(&id.into()).await.unwrap();
        manager
            .replace_local_stream(Some(self.devices.stream_for(id)))
            .await;
        Node {
            manager,
            links,
            signals,
            events,
        }
    }
}

/// Deliver link events and signals until nothing moves.
async fn settle(nodes: &mut [&mut Node]) {
    loop {
        let mut progressed = false;
        for node in nodes.iter_mut() {
            while let Ok(notice) = node.links.try_recv() {
                node.manager.handle_link_event(notice).await;
                progressed = true;
            }
            while let Ok(envelope) = node.signals.try_recv() {
                let from = envelope.from.clone();
                node.manager.handle_incoming_signal(&from, envelope).await;
                progressed = true;
            }
        }
        if !progressed {
            return;
        }
    }
}

fn id(s: &str) -> ParticipantId {
    ParticipantId::from(s)
}

async fn connected_pair(mesh: &Mesh) -> (Node, Node) {
    let mut amy = mesh.node("amy").await;
    let mut zed = mesh.node("zed").await;
    assert_eq!(
        zed.manager.ensure_connection(&id("amy")).await,
        EnsureOutcome::Initiated
    );
    settle(&mut [&mut amy, &mut zed]).await;
    assert_eq!(amy.manager.peer_state(&id("zed")), Some(PeerState::Connected));
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Connected));
    (amy, zed)
}

// ---------------------------------------------------------------------------
// Election & idempotency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ensure_connection_is_idempotent() {
    let mesh = Mesh::new();
    let mut zed = mesh.node("zed").await;

    assert_eq!(
        zed.manager.ensure_connection(&id("amy")).await,
        EnsureOutcome::Initiated
    );
    for _ in 0..5 {
        assert_eq!(
            zed.manager.ensure_connection(&id("amy")).await,
            EnsureOutcome::Existing
        );
    }
    assert_eq!(mesh.network.links_opened(), 1);
    assert_eq!(zed.manager.live_count(), 1);
}

#[tokio::test]
async fn lower_id_waits_for_offer() {
    let mesh = Mesh::new();
    let mut amy = mesh.node("amy").await;
    assert_eq!(
        amy.manager.ensure_connection(&id("zed")).await,
        EnsureOutcome::AwaitingOffer
    );
    assert_eq!(
        amy.manager.ensure_connection(&id("amy")).await,
        EnsureOutcome::Deferred
    );
    assert_eq!(mesh.network.links_opened(), 0);
}

#[tokio::test]
async fn no_local_stream_defers() {
    let mesh = Mesh::new();
    let mut zed = mesh.node("zed").await;
    zed.manager.replace_local_stream(None).await;
    assert_eq!(
        zed.manager.ensure_connection(&id("amy")).await,
        EnsureOutcome::Deferred
    );
}

#[tokio::test]
async fn peer_cap_refuses_new_initiations() {
    let mesh = Mesh::with_config(VoiceConfig {
        max_peers: 1,
        ..Default::default()
    });
    let mut zed = mesh.node("zed").await;
    assert_eq!(
        zed.manager.ensure_connection(&id("amy")).await,
        EnsureOutcome::Initiated
    );
    assert_eq!(
        zed.manager.ensure_connection(&id("bob")).await,
        EnsureOutcome::Deferred
    );
}

// ---------------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offer_answer_reaches_connected() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;

    assert_eq!(mesh.network.role("zed", "amy"), Some(Role::Initiator));
    assert_eq!(mesh.network.role("amy", "zed"), Some(Role::Responder));
    assert_eq!(mesh.network.links_opened(), 2);
    assert_eq!(amy.manager.remote_stream_count(), 1);

    let info = &amy.manager.peers()[0];
    assert_eq!(info.role, Role::Responder);
    assert!(info.has_remote_stream);

    let events = zed.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, VoiceEvent::PeerConnected { peer, .. } if peer.as_str() == "amy")));
    assert_eq!(mesh.devices.open_analysers(), 2);
    amy.drain_events();
}

#[tokio::test]
async fn stale_answers_and_candidates_are_dropped() {
    let mesh = Mesh::new();
    let mut amy = mesh.node("amy").await;

    let answer = SignalEnvelope::new(id("zed"), id("amy"), SignalPayload::Answer { sdp: "v=0".into() });
    amy.manager.handle_incoming_signal(&id("zed"), answer).await;
    let candidate = SignalEnvelope::new(
        id("zed"),
        id("amy"),
        SignalPayload::IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        },
    );
    amy.manager.handle_incoming_signal(&id("zed"), candidate).await;

    assert!(amy.manager.peers().is_empty());
    assert_eq!(mesh.network.links_opened(), 0);
}

#[tokio::test]
async fn misaddressed_signal_is_dropped() {
    let mesh = Mesh::new();
    let mut amy = mesh.node("amy").await;
    let offer = SignalEnvelope::new(id("zed"), id("bob"), SignalPayload::Offer { sdp: "v=0".into() });
    amy.manager.handle_incoming_signal(&id("zed"), offer).await;
    assert!(amy.manager.peers().is_empty());
}

#[tokio::test]
async fn events_from_retired_links_are_ignored() {
    let mesh = Mesh::new();
    let (mut amy, _zed) = connected_pair(&mesh).await;

    let stale = LinkNotice {
        peer: id("zed"),
        generation: 0,
        event: LinkEvent::Close,
    };
    amy.manager.handle_link_event(stale).await;
    assert_eq!(amy.manager.peer_state(&id("zed")), Some(PeerState::Connected));
}

// ---------------------------------------------------------------------------
// Error triage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn benign_errors_keep_the_link() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;

    for err in [
        LinkError::new(LinkErrorKind::InvalidState, "Called in wrong state: stable"),
        LinkError::new(LinkErrorKind::SignalAfterDestroy, "cannot signal after peer is destroyed"),
        LinkError::new(LinkErrorKind::IceTransient, "ICE candidate error"),
    ] {
        assert!(mesh.network.inject_error("amy", "zed", err));
        settle(&mut [&mut amy, &mut zed]).await;
        assert_eq!(amy.manager.peer_state(&id("zed")), Some(PeerState::Connected));
    }
    assert_eq!(mesh.network.links_opened(), 2);
}

#[tokio::test]
async fn glare_offer_is_benign() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;

    // An offer reaching the initiator fails with a wrong-state error.
    let offer = SignalEnvelope::new(id("amy"), id("zed"), SignalPayload::Offer { sdp: "v=0".into() });
    zed.manager.handle_incoming_signal(&id("amy"), offer).await;
    settle(&mut [&mut amy, &mut zed]).await;
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Connected));
}

#[tokio::test]
async fn transient_ice_error_is_fatal_before_connecting() {
    let mesh = Mesh::new();
    let mut zed = mesh.node("zed").await;
    zed.manager.ensure_connection(&id("amy")).await;

    mesh.network
        .inject_error("zed", "amy", LinkError::new(LinkErrorKind::IceTransient, "ICE candidate error"));
    settle(&mut [&mut zed]).await;
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Closed));
}

#[tokio::test]
async fn fatal_error_closes_both_sides() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;
    amy.drain_events();

    mesh.network
        .inject_error("amy", "zed", LinkError::from_message("Connection failed."));
    settle(&mut [&mut amy, &mut zed]).await;

    assert_eq!(amy.manager.peer_state(&id("zed")), Some(PeerState::Closed));
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Closed));
    assert_eq!(amy.manager.remote_stream_count(), 0);
    assert_eq!(mesh.network.live_links(), 0);
    assert_eq!(mesh.devices.open_analysers(), 0);

    let events = amy.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        VoiceEvent::PeerDisconnected { reason: CloseReason::Fatal(_), .. }
    )));
}

#[tokio::test]
async fn ice_failure_closes_link() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;

    mesh.network
        .set_ice_state("zed", "amy", IceConnectionState::Failed);
    settle(&mut [&mut amy, &mut zed]).await;
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Closed));
    assert_eq!(amy.manager.peer_state(&id("zed")), Some(PeerState::Closed));
}

// ---------------------------------------------------------------------------
// Tombstones & deadlines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tombstone_blocks_reinitiation_until_reaped() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;
    mesh.network
        .inject_error("zed", "amy", LinkError::from_message("boom"));
    settle(&mut [&mut amy, &mut zed]).await;

    assert_eq!(
        zed.manager.ensure_connection(&id("amy")).await,
        EnsureOutcome::Deferred
    );
    assert!(zed.manager.reap_closed(Instant::now()).await.is_empty());

    let later = Instant::now() + Duration::from_millis(1600);
    assert_eq!(zed.manager.reap_closed(later).await, [id("amy")]);
    assert_eq!(amy.manager.reap_closed(later).await, [id("zed")]);
    assert_eq!(
        zed.manager.ensure_connection(&id("amy")).await,
        EnsureOutcome::Initiated
    );
    settle(&mut [&mut amy, &mut zed]).await;
    assert_eq!(amy.manager.peer_state(&id("zed")), Some(PeerState::Connected));
}

#[tokio::test]
async fn fresh_offer_replaces_tombstone() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;
    mesh.network
        .inject_error("amy", "zed", LinkError::from_message("boom"));
    settle(&mut [&mut amy, &mut zed]).await;
    assert_eq!(amy.manager.peer_state(&id("zed")), Some(PeerState::Closed));

    // zed forgets its tombstone first (e.g. it reloaded) and offers again.
    zed.manager.teardown(&id("amy")).await;
    zed.manager.ensure_connection(&id("amy")).await;
    settle(&mut [&mut amy, &mut zed]).await;
    assert_eq!(amy.manager.peer_state(&id("zed")), Some(PeerState::Connected));
}

#[tokio::test]
async fn stalled_negotiation_times_out() {
    let mesh = Mesh::new();
    let mut zed = mesh.node("zed").await;
    zed.manager.ensure_connection(&id("amy")).await;

    zed.manager.expire_stalled(Instant::now()).await;
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Negotiating));

    zed.manager
        .expire_stalled(Instant::now() + Duration::from_secs(21))
        .await;
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Closed));
    let events = zed.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        VoiceEvent::PeerDisconnected { reason: CloseReason::NegotiationTimeout, .. }
    )));
}

#[tokio::test]
async fn zero_timeout_disables_deadline() {
    let mesh = Mesh::with_config(VoiceConfig {
        negotiation_timeout_secs: 0,
        ..Default::default()
    });
    let mut zed = mesh.node("zed").await;
    zed.manager.ensure_connection(&id("amy")).await;
    zed.manager
        .expire_stalled(Instant::now() + Duration::from_secs(3600))
        .await;
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Negotiating));
}

// ---------------------------------------------------------------------------
// Roster, stream replacement, teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn roster_sync_initiates_and_prunes() {
    let mesh = Mesh::new();
    let mut zed = mesh.node("zed").await;

    zed.manager
        .sync_roster(&[id("zed"), id("amy"), id("bob")])
        .await;
    assert_eq!(zed.manager.live_count(), 2);

    zed.manager.sync_roster(&[id("zed"), id("bob")]).await;
    assert_eq!(zed.manager.peer_state(&id("amy")), None);
    assert_eq!(zed.manager.live_count(), 1);
    assert_eq!(mesh.network.live_links(), 1);
}

#[tokio::test]
async fn replacing_local_stream_rebuilds_links() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;
    zed.manager.sync_roster(&[id("amy"), id("zed")]).await;
    amy.manager.sync_roster(&[id("amy"), id("zed")]).await;

    let fresh: MediaStream = mesh.devices.stream_for("zed");
    zed.manager.replace_local_stream(Some(fresh.clone())).await;
    assert_eq!(zed.manager.local_stream(), Some(&fresh));

    // amy saw the old link close and holds a tombstone; reap it, then the
    // new offer goes through.
    settle(&mut [&mut amy, &mut zed]).await;
    amy.manager
        .reap_closed(Instant::now() + Duration::from_secs(2))
        .await;
    settle(&mut [&mut amy, &mut zed]).await;

    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Connected));
    assert_eq!(mesh.network.links_opened(), 4);
}

#[tokio::test]
async fn responder_stream_replacement_reconnects_after_grace() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;
    zed.manager.sync_roster(&[id("amy"), id("zed")]).await;
    amy.manager.sync_roster(&[id("amy"), id("zed")]).await;

    // amy is the lower id, so after replacing her stream she can only wait.
    let fresh = mesh.devices.stream_for("amy");
    amy.manager.replace_local_stream(Some(fresh)).await;
    settle(&mut [&mut amy, &mut zed]).await;
    assert_eq!(amy.manager.peer_state(&id("zed")), None);
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Closed));

    // Within grace nothing happens.
    assert!(zed.manager.reap_closed(Instant::now()).await.is_empty());
    assert_eq!(mesh.network.links_opened(), 2);

    let reaped = zed
        .manager
        .reap_closed(Instant::now() + Duration::from_secs(2))
        .await;
    assert_eq!(reaped, [id("amy")]);
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Negotiating));
    settle(&mut [&mut amy, &mut zed]).await;

    assert_eq!(amy.manager.peer_state(&id("zed")), Some(PeerState::Connected));
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Connected));
    assert_eq!(mesh.network.links_opened(), 4);
}

#[tokio::test]
async fn reaped_peers_outside_the_roster_stay_down() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;
    mesh.network
        .inject_error("zed", "amy", LinkError::from_message("boom"));
    settle(&mut [&mut amy, &mut zed]).await;

    let reaped = zed
        .manager
        .reap_closed(Instant::now() + Duration::from_secs(2))
        .await;
    assert_eq!(reaped, [id("amy")]);
    assert_eq!(zed.manager.peer_state(&id("amy")), None);
    assert_eq!(mesh.network.links_opened(), 2);
}

#[tokio::test]
async fn teardown_all_releases_everything() {
    let mesh = Mesh::new();
    let (mut amy, mut zed) = connected_pair(&mesh).await;
    mesh.devices.set_level("zed", 80);
    amy.manager.sample_frame(Some(false)).await;
    assert_eq!(amy.manager.speaking().get(&id("zed")), Some(true));

    amy.manager.teardown_all().await;
    assert_eq!(amy.manager.live_count(), 0);
    assert_eq!(amy.manager.remote_stream_count(), 0);
    assert!(amy.manager.peers().is_empty());
    let speaking = amy.manager.speaking().snapshot();
    assert!(speaking.keys().all(|k| k.as_str() == "amy"));

    settle(&mut [&mut amy, &mut zed]).await;
    assert_eq!(zed.manager.peer_state(&id("amy")), Some(PeerState::Closed));
    zed.manager.teardown_all().await;
    assert_eq!(mesh.devices.open_analysers(), 0);
}

#[tokio::test]
async fn speaking_commits_only_changes() {
    let mesh = Mesh::new();
    let (mut amy, _zed) = connected_pair(&mesh).await;
    amy.drain_events();

    mesh.devices.set_level("zed", 60);
    amy.manager.sample_frame(Some(false)).await;
    amy.manager.sample_frame(Some(false)).await;
    mesh.devices.set_level("zed", 0);
    amy.manager.sample_frame(Some(false)).await;

    let changes: Vec<(String, bool)> = amy
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            VoiceEvent::SpeakingChanged {
                participant,
                speaking,
            } => Some((participant.to_string(), speaking)),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![("zed".to_string(), true), ("zed".to_string(), false)]
    );
}

/// Subscribes fine but fails every send.
struct UnreachableSignaling;

#[async_trait]
impl SignalingChannel for UnreachableSignaling {
    async fn send(&self, _to: &ParticipantId, _envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        Err(SignalingError::Store(StoreError::Disconnected))
    }

    async fn subscribe(
        &self,
        _me: &ParticipantId,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, SignalingError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn unsubscribe(&self, _me: &ParticipantId) -> Result<(), SignalingError> {
        Ok(())
    }
}

#[tokio::test]
async fn undeliverable_signals_are_reported() {
    let devices = SyntheticDevices::new();
    let (event_tx, mut events) = mpsc::channel(64);
    let (mut manager, mut links) = PeerManager::new(
        id("zed"),
        &VoiceConfig::default(),
        Arc::new(LoopbackNetwork::new()),
        Arc::new(UnreachableSignaling),
        Arc::new(devices.microphone("zed")),
        event_tx,
    );
    manager
        .replace_local_stream(Some(devices.stream_for("zed")))
        .await;
    assert_eq!(
        manager.ensure_connection(&id("amy")).await,
        EnsureOutcome::Initiated
    );
    while let Ok(notice) = links.try_recv() {
        manager.handle_link_event(notice).await;
    }

    let mut errors = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let VoiceEvent::Error(message) = event {
            errors.push(message);
        }
    }
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|m| m.contains("amy")));
}
