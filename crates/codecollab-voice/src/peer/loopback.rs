//! In-process transport that links participants sharing one network.
//!
//! Negotiation payloads still travel through whatever signaling channel
//! the caller uses; only the "media path" is simulated. When an initiator
//! applies an answer, it is paired with the responder link going the
//! other way and each side receives the other's local stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use codecollab_common::ParticipantId;
use tracing::trace;

use super::error::{LinkError, LinkErrorKind};
use super::transport::{LinkEvent, LinkEventSender, LinkNotice, LinkParams, PeerLink, PeerTransport};
use super::types::{IceConnectionState, Role};
use crate::protocol::SignalPayload;

/// (local, remote)
type LinkKey = (ParticipantId, ParticipantId);

struct Endpoint {
    link_id: u64,
    params: LinkParams,
    events: LinkEventSender,
    ice: IceConnectionState,
    /// Responder: answer produced. Initiator: answer applied.
    answered: bool,
    partner: Option<u64>,
}

impl Endpoint {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(LinkNotice::new(&self.params, event));
    }

    fn set_ice(&mut self, state: IceConnectionState) {
        if self.ice != state {
            self.ice = state;
            self.emit(LinkEvent::IceStateChanged(state));
        }
    }

    fn sdp(&self, kind: &str) -> String {
        format!(
            "v=0\r\no={} {} {} IN IP4 127.0.0.1\r\ns={kind}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.params.local_id, self.link_id, self.params.generation
        )
    }

    fn candidate(&self) -> SignalPayload {
        SignalPayload::IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.link_id,
                40000 + self.link_id % 20000
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

#[derive(Default)]
struct Net {
    endpoints: HashMap<LinkKey, Endpoint>,
    next_link: u64,
}

impl Net {
    /// Pair the initiator at `key` with the answering responder opposite it.
    fn connect(&mut self, key: &LinkKey) {
        let reverse = (key.1.clone(), key.0.clone());
        let Some(responder) = self.endpoints.get(&reverse) else {
            return;
        };
        if responder.params.role != Role::Responder || !responder.answered || responder.partner.is_some()
        {
            return;
        }
        let responder_id = responder.link_id;
        let responder_stream = responder.params.local_stream.mirror();

        let Some(initiator) = self.endpoints.get_mut(key) else {
            return;
        };
        initiator.partner = Some(responder_id);
        initiator.set_ice(IceConnectionState::Connected);
        initiator.emit(LinkEvent::Stream(responder_stream));
        let initiator_id = initiator.link_id;
        let initiator_stream = initiator.params.local_stream.mirror();

        if let Some(responder) = self.endpoints.get_mut(&reverse) {
            responder.partner = Some(initiator_id);
            responder.set_ice(IceConnectionState::Connected);
            responder.emit(LinkEvent::Stream(initiator_stream));
        }
        trace!(local = %key.0, remote = %key.1, "Loopback link connected");
    }
}

/// Shared simulated network. Implements [`PeerTransport`] for every
/// participant attached to it.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    net: Arc<Mutex<Net>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn net(&self) -> MutexGuard<'_, Net> {
        self.net.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(local: &str, remote: &str) -> LinkKey {
        (ParticipantId::from(local), ParticipantId::from(remote))
    }

    /// Total links ever opened.
    pub fn links_opened(&self) -> u64 {
        self.net().next_link
    }

    /// Links not yet destroyed.
    pub fn live_links(&self) -> usize {
        self.net().endpoints.len()
    }

    /// Whether `local`'s link to `remote` is paired and carrying media.
    pub fn is_connected(&self, local: &str, remote: &str) -> bool {
        self.net()
            .endpoints
            .get(&Self::key(local, remote))
            .is_some_and(|e| e.partner.is_some() && e.ice.is_healthy())
    }

    /// Role of `local`'s live link to `remote`.
    pub fn role(&self, local: &str, remote: &str) -> Option<Role> {
        self.net()
            .endpoints
            .get(&Self::key(local, remote))
            .map(|e| e.params.role)
    }

    /// Make `local`'s link to `remote` report `err`. Returns false if no such link.
    pub fn inject_error(&self, local: &str, remote: &str, err: LinkError) -> bool {
        match self.net().endpoints.get(&Self::key(local, remote)) {
            Some(endpoint) => {
                endpoint.emit(LinkEvent::Error(err));
                true
            }
            None => false,
        }
    }

    /// Force the ICE state of `local`'s link to `remote`.
    pub fn set_ice_state(&self, local: &str, remote: &str, state: IceConnectionState) -> bool {
        match self.net().endpoints.get_mut(&Self::key(local, remote)) {
            Some(endpoint) => {
                endpoint.set_ice(state);
                true
            }
            None => false,
        }
    }
}

impl PeerTransport for LoopbackNetwork {
    fn open(&self, params: LinkParams, events: LinkEventSender) -> Result<Box<dyn PeerLink>, LinkError> {
        let mut net = self.net();
        net.next_link += 1;
        let link_id = net.next_link;
        let key = (params.local_id.clone(), params.remote_id.clone());

        let endpoint = Endpoint {
            link_id,
            params,
            events,
            ice: IceConnectionState::New,
            answered: false,
            partner: None,
        };
        if endpoint.params.role == Role::Initiator {
            endpoint.emit(LinkEvent::Signal(SignalPayload::Offer {
                sdp: endpoint.sdp("offer"),
            }));
            endpoint.emit(LinkEvent::Signal(endpoint.candidate()));
        }
        trace!(local = %key.0, remote = %key.1, link_id, role = %endpoint.params.role, "Loopback link opened");
        net.endpoints.insert(key.clone(), endpoint);

        Ok(Box::new(LoopbackLink {
            network: self.clone(),
            key,
            link_id,
            destroyed: false,
        }))
    }
}

struct LoopbackLink {
    network: LoopbackNetwork,
    key: LinkKey,
    link_id: u64,
    destroyed: bool,
}

impl LoopbackLink {
    fn after_destroy() -> LinkError {
        LinkError::new(
            LinkErrorKind::SignalAfterDestroy,
            "cannot signal after peer is destroyed",
        )
    }
}

impl PeerLink for LoopbackLink {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), LinkError> {
        if self.destroyed {
            return Err(Self::after_destroy());
        }
        let mut net = self.network.net();
        let Some(endpoint) = net
            .endpoints
            .get_mut(&self.key)
            .filter(|e| e.link_id == self.link_id)
        else {
            return Err(Self::after_destroy());
        };

        match payload {
            SignalPayload::Offer { .. } => {
                if endpoint.params.role == Role::Initiator {
                    return Err(LinkError::new(
                        LinkErrorKind::InvalidState,
                        "Failed to set remote offer sdp: Called in wrong state: have-local-offer",
                    ));
                }
                endpoint.answered = true;
                endpoint.set_ice(IceConnectionState::Checking);
                endpoint.emit(LinkEvent::Signal(SignalPayload::Answer {
                    sdp: endpoint.sdp("answer"),
                }));
                endpoint.emit(LinkEvent::Signal(endpoint.candidate()));
            }
            SignalPayload::Answer { .. } => {
                if endpoint.params.role == Role::Responder || endpoint.answered {
                    return Err(LinkError::new(
                        LinkErrorKind::InvalidState,
                        "Failed to set remote answer sdp: Called in wrong state: stable",
                    ));
                }
                endpoint.answered = true;
                endpoint.set_ice(IceConnectionState::Checking);
                net.connect(&self.key);
            }
            SignalPayload::IceCandidate { .. } => {}
        }
        Ok(())
    }

    fn ice_state(&self) -> IceConnectionState {
        if self.destroyed {
            return IceConnectionState::Closed;
        }
        self.network
            .net()
            .endpoints
            .get(&self.key)
            .filter(|e| e.link_id == self.link_id)
            .map_or(IceConnectionState::Closed, |e| e.ice)
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let mut net = self.network.net();
        let owned = net
            .endpoints
            .get(&self.key)
            .is_some_and(|e| e.link_id == self.link_id);
        if !owned {
            return;
        }
        let partner = net.endpoints.remove(&self.key).and_then(|e| e.partner);

        // The other side sees the link close.
        if let Some(partner_id) = partner {
            let reverse = (self.key.1.clone(), self.key.0.clone());
            if let Some(other) = net.endpoints.get_mut(&reverse) {
                if other.link_id == partner_id {
                    other.partner = None;
                    other.ice = IceConnectionState::Closed;
                    other.emit(LinkEvent::Close);
                }
            }
        }
        trace!(local = %self.key.0, remote = %self.key.1, "Loopback link destroyed");
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::media::{AudioTrack, MediaStream};

    fn params(local: &str, remote: &str, role: Role) -> LinkParams {
        LinkParams {
            local_id: local.into(),
            remote_id: remote.into(),
            role,
            local_stream: MediaStream::new(vec![AudioTrack::new(local)]),
            ice_servers: Vec::new(),
            generation: 1,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LinkNotice>) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            out.push(notice.event);
        }
        out
    }

    fn signals(events: &[LinkEvent]) -> Vec<SignalPayload> {
        events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Signal(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn offer_answer_exchange_connects_both_sides() {
        let net = LoopbackNetwork::new();
        let (zed_tx, mut zed_rx) = mpsc::unbounded_channel();
        let (amy_tx, mut amy_rx) = mpsc::unbounded_channel();

        let mut zed = net.open(params("zed", "amy", Role::Initiator), zed_tx).unwrap();
        let zed_signals = signals(&drain(&mut zed_rx));
        assert!(zed_signals[0].is_offer());

        let mut amy = net.open(params("amy", "zed", Role::Responder), amy_tx).unwrap();
        for payload in zed_signals {
            amy.signal(payload).unwrap();
        }
        for payload in signals(&drain(&mut amy_rx)) {
            zed.signal(payload).unwrap();
        }

        assert!(net.is_connected("zed", "amy"));
        assert!(net.is_connected("amy", "zed"));
        assert_eq!(zed.ice_state(), IceConnectionState::Connected);

        let streams: Vec<_> = drain(&mut amy_rx)
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Stream(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].tracks()[0].label(), "zed");
    }

    #[test]
    fn wrong_state_errors_are_typed() {
        let net = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut zed = net.open(params("zed", "amy", Role::Initiator), tx).unwrap();
        let err = zed.signal(SignalPayload::Offer { sdp: "x".into() }).unwrap_err();
        assert_eq!(err.kind, LinkErrorKind::InvalidState);

        zed.destroy();
        let err = zed.signal(SignalPayload::Answer { sdp: "x".into() }).unwrap_err();
        assert_eq!(err.kind, LinkErrorKind::SignalAfterDestroy);
        assert_eq!(zed.ice_state(), IceConnectionState::Closed);
        assert_eq!(net.live_links(), 0);
    }

    #[test]
    fn destroy_closes_partner() {
        let net = LoopbackNetwork::new();
        let (zed_tx, mut zed_rx) = mpsc::unbounded_channel();
        let (amy_tx, mut amy_rx) = mpsc::unbounded_channel();
        let mut zed = net.open(params("zed", "amy", Role::Initiator), zed_tx).unwrap();
        let mut amy = net.open(params("amy", "zed", Role::Responder), amy_tx).unwrap();
        for p in signals(&drain(&mut zed_rx)) {
            amy.signal(p).unwrap();
        }
        for p in signals(&drain(&mut amy_rx)) {
            zed.signal(p).unwrap();
        }
        drain(&mut amy_rx);

        zed.destroy();
        let events = drain(&mut amy_rx);
        assert!(matches!(events.as_slice(), [LinkEvent::Close]));
        assert_eq!(amy.ice_state(), IceConnectionState::Closed);
    }
}
