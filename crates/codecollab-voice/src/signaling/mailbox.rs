//! Mailbox-backed signaling over a key-value store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use codecollab_common::ParticipantId;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{SignalingChannel, SignalingError};
use crate::protocol::{paths, SignalEnvelope};
use crate::store::{ChildEvent, KvStore, StoreSubscription};

/// Signaling through `rooms/{room}/signals/{participant}` mailboxes.
///
/// Senders append with ordered push keys. A subscriber replays its
/// mailbox, hands every envelope it did not author to the receiver, and
/// deletes the entry right after.
pub struct MailboxChannel {
    store: Arc<dyn KvStore>,
    room_id: String,
    pumps: Mutex<HashMap<ParticipantId, JoinHandle<()>>>,
}

impl MailboxChannel {
    pub fn new(store: Arc<dyn KvStore>, room_id: impl Into<String>) -> Self {
        Self {
            store,
            room_id: room_id.into(),
            pumps: Mutex::new(HashMap::new()),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

impl Drop for MailboxChannel {
    fn drop(&mut self) {
        for (_, pump) in self.pumps.get_mut().drain() {
            pump.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for MailboxChannel {
    async fn send(&self, to: &ParticipantId, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        let value = serde_json::to_value(envelope)?;
        let key = self
            .store
            .append(&paths::mailbox(&self.room_id, to), value)
            .await?;
        debug!(to = %to, kind = ?envelope.kind, key = %key, "Signal sent");
        Ok(())
    }

    async fn subscribe(
        &self,
        me: &ParticipantId,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, SignalingError> {
        let mailbox = paths::mailbox(&self.room_id, me);
        let subscription = self.store.subscribe(&mailbox).await?;
        let (tx, rx) = mpsc::channel(256);

        let pump = tokio::spawn(pump_mailbox(
            Arc::clone(&self.store),
            me.clone(),
            subscription,
            tx,
        ));
        if let Some(previous) = self.pumps.lock().await.insert(me.clone(), pump) {
            previous.abort();
        }
        info!(room = %self.room_id, participant = %me, "Subscribed to mailbox");
        Ok(rx)
    }

    async fn unsubscribe(&self, me: &ParticipantId) -> Result<(), SignalingError> {
        if let Some(pump) = self.pumps.lock().await.remove(me) {
            pump.abort();
        }
        self.store
            .remove(&paths::mailbox(&self.room_id, me))
            .await?;
        info!(room = %self.room_id, participant = %me, "Mailbox removed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

async fn pump_mailbox(
    store: Arc<dyn KvStore>,
    me: ParticipantId,
    mut subscription: StoreSubscription,
    tx: mpsc::Sender<SignalEnvelope>,
) {
    while let Some(event) = subscription.next().await {
        let ChildEvent::Added { key, value } = event else {
            continue;
        };
        let entry = format!("{}/{}", subscription.path(), key);

        match serde_json::from_value::<SignalEnvelope>(value) {
            Ok(envelope) if envelope.from == me => {
                // Our own echo; leave it for whoever wrote it.
                continue;
            }
            Ok(envelope) => {
                if tx.send(envelope).await.is_err() {
                    debug!(participant = %me, "Signal receiver dropped; stopping pump");
                    return;
                }
            }
            Err(e) => {
                warn!(participant = %me, key = %key, error = %e, "Discarding undecodable signal");
            }
        }

        if let Err(e) = store.remove(&entry).await {
            warn!(participant = %me, key = %key, error = %e, "Failed to delete consumed signal");
        }
    }
    debug!(participant = %me, "Mailbox subscription ended");
}
