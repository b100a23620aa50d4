//! Store trait, child events, and errors.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store path: {0}")]
    InvalidPath(String),

    #[error("store is disconnected")]
    Disconnected,

    #[error("store request timed out")]
    Timeout,

    #[error("store rejected request: {0}")]
    Rejected(String),

    #[error("store payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Child events
// ---------------------------------------------------------------------------

/// Change to a direct child of a watched path.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Added { key: String, value: Value },
    Changed { key: String, value: Value },
    Removed { key: String },
}

impl ChildEvent {
    pub fn key(&self) -> &str {
        match self {
            ChildEvent::Added { key, .. }
            | ChildEvent::Changed { key, .. }
            | ChildEvent::Removed { key } => key,
        }
    }
}

/// Live view of the direct children of a path.
///
/// Existing children are replayed as [`ChildEvent::Added`] in key order
/// before any live change. Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct StoreSubscription {
    path: String,
    rx: mpsc::UnboundedReceiver<ChildEvent>,
}

impl StoreSubscription {
    pub fn new(path: String, rx: mpsc::UnboundedReceiver<ChildEvent>) -> Self {
        Self { path, rx }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next child event, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<ChildEvent> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Hierarchical key-value store with `/`-separated paths.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Overwrite the value at `path`, replacing anything below it.
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Store `value` under a new child of `prefix` and return the child key.
    /// Keys sort in append order.
    async fn append(&self, prefix: &str, value: Value) -> Result<String, StoreError>;

    /// Read the value at `path`. Subtrees come back as nested objects.
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Remove `path` and everything below it. Removing a missing path is not an error.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Watch the direct children of `path`.
    async fn subscribe(&self, path: &str) -> Result<StoreSubscription, StoreError>;
}
