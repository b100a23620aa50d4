//! Delivery of negotiation payloads between two participants.
//!
//! The peer layer only needs [`SignalingChannel`]; [`MailboxChannel`]
//! implements it on top of per-recipient mailboxes in a [`KvStore`](crate::store::KvStore).

mod mailbox;

pub use mailbox::MailboxChannel;

use async_trait::async_trait;
use codecollab_common::ParticipantId;
use tokio::sync::mpsc;

use crate::protocol::SignalEnvelope;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Transport for signal envelopes.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver `envelope` to `to`. Concurrent senders never overwrite each other.
    async fn send(&self, to: &ParticipantId, envelope: &SignalEnvelope) -> Result<(), SignalingError>;

    /// Start receiving envelopes addressed to `me`. Each delivered envelope
    /// is consumed; it will not be delivered again.
    async fn subscribe(
        &self,
        me: &ParticipantId,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, SignalingError>;

    /// Stop receiving and discard anything still queued for `me`.
    async fn unsubscribe(&self, me: &ParticipantId) -> Result<(), SignalingError>;
}
