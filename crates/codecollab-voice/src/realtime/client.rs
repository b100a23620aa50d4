//! Public handle for a relay-backed store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codecollab_common::new_id;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::connection::connection_loop;
use super::types::{RealtimeConfig, RealtimeEvent, ReplyData, StoreCommand, StoreOp};
use crate::store::{normalize_path, KvStore, StoreError, StoreSubscription};

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`KvStore`] backed by a `codecollab-relay` over WebSocket.
///
/// Cloning yields another handle onto the same background connection.
#[derive(Clone)]
pub struct RealtimeStore {
    command_tx: mpsc::Sender<StoreCommand>,
    connected: Arc<RwLock<bool>>,
    request_timeout: Duration,
}

impl RealtimeStore {
    /// Create a new client and start the background connection.
    /// Returns `(client, event_receiver)`.
    pub fn connect(config: RealtimeConfig) -> (Self, mpsc::Receiver<RealtimeEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);
        let connected = Arc::new(RwLock::new(false));

        let client = Self {
            command_tx,
            connected: Arc::clone(&connected),
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        };

        tokio::spawn(connection_loop(config, connected, event_tx, command_rx));

        (client, event_rx)
    }

    /// Check if connected.
    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(&self) {
        let _ = self.command_tx.send(StoreCommand::Disconnect).await;
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Result<ReplyData, StoreError>>,
    ) -> Result<ReplyData, StoreError> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StoreError::Disconnected),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn request(&self, op: StoreOp) -> Result<ReplyData, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(StoreCommand::Request { op, reply })
            .await
            .map_err(|_| StoreError::Disconnected)?;
        self.await_reply(rx).await
    }
}

#[async_trait]
impl KvStore for RealtimeStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let path = normalize_path(path)?;
        self.request(StoreOp::Write { path, value }).await?;
        Ok(())
    }

    async fn append(&self, prefix: &str, value: Value) -> Result<String, StoreError> {
        let path = normalize_path(prefix)?;
        self.request(StoreOp::Append { path, value })
            .await?
            .key
            .ok_or_else(|| StoreError::Rejected("append reply carried no key".to_string()))
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let path = normalize_path(path)?;
        Ok(self.request(StoreOp::Read { path }).await?.value)
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let path = normalize_path(path)?;
        self.request(StoreOp::Remove { path }).await?;
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<StoreSubscription, StoreError> {
        let path = normalize_path(path)?;
        let (tx, events) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(StoreCommand::Subscribe {
                sub: subscription_id(),
                path: path.clone(),
                tx,
                reply,
            })
            .await
            .map_err(|_| StoreError::Disconnected)?;
        self.await_reply(rx).await?;
        Ok(StoreSubscription::new(path, events))
    }
}

/// Subscription ids key the connection's routing table, so they are
/// full UUIDs.
fn subscription_id() -> String {
    new_id()
}
