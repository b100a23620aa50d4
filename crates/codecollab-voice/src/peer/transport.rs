//! Seam to the peer-to-peer media stack.

use codecollab_common::ParticipantId;
use tokio::sync::mpsc;

use super::error::LinkError;
use super::types::{IceConnectionState, Role};
use crate::media::MediaStream;
use crate::protocol::SignalPayload;

/// Everything needed to open one link.
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub local_id: ParticipantId,
    pub remote_id: ParticipantId,
    pub role: Role,
    pub local_stream: MediaStream,
    pub ice_servers: Vec<String>,
    /// Tag stamped on every event from this link.
    pub generation: u64,
}

/// Events a link reports back to its owner.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Negotiation payload to forward to the remote side.
    Signal(SignalPayload),
    /// Remote media arrived.
    Stream(MediaStream),
    Error(LinkError),
    IceStateChanged(IceConnectionState),
    Close,
}

/// A [`LinkEvent`] addressed by peer and link generation.
#[derive(Debug, Clone)]
pub struct LinkNotice {
    pub peer: ParticipantId,
    pub generation: u64,
    pub event: LinkEvent,
}

impl LinkNotice {
    pub fn new(params: &LinkParams, event: LinkEvent) -> Self {
        Self {
            peer: params.remote_id.clone(),
            generation: params.generation,
            event,
        }
    }
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkNotice>;

/// One negotiated connection to a remote participant.
pub trait PeerLink: Send {
    /// Apply a payload received from the remote side.
    fn signal(&mut self, payload: SignalPayload) -> Result<(), LinkError>;

    fn ice_state(&self) -> IceConnectionState;

    /// Close the link. Further signals fail with `SignalAfterDestroy`.
    fn destroy(&mut self);
}

/// Factory for links. Initiators start emitting offers immediately.
pub trait PeerTransport: Send + Sync {
    fn open(&self, params: LinkParams, events: LinkEventSender) -> Result<Box<dyn PeerLink>, LinkError>;
}
