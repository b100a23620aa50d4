//! Configuration, wire frames, and internal commands for the realtime client.

use codecollab_config::StoreConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::store::{ChildEvent, StoreError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for connecting to a store relay.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// WebSocket URL of the relay (e.g., "ws://127.0.0.1:8787").
    pub url: String,
    /// Reconnect base delay in seconds.
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect delay in seconds.
    pub max_reconnect_delay_secs: u64,
    /// Keepalive ping interval in seconds.
    pub ping_interval_secs: u64,
    /// How long a request may wait for its reply.
    pub request_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for RealtimeConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            url: config.url.clone(),
            reconnect_delay_secs: config.reconnect_delay_secs,
            max_reconnect_delay_secs: config.max_reconnect_delay_secs,
            ping_interval_secs: config.ping_interval_secs,
            request_timeout_secs: config.request_timeout_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

/// Operation carried by a client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    Write { path: String, value: Value },
    Append { path: String, value: Value },
    Read { path: String },
    Remove { path: String },
    /// Watch the children of `path`; events are tagged with `sub`.
    Subscribe { path: String, sub: String },
    Unsubscribe { sub: String },
    Ping,
}

/// Client → relay frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "ref")]
    pub msg_ref: String,
    #[serde(flatten)]
    pub op: StoreOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Relay → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        #[serde(rename = "ref")]
        msg_ref: String,
        status: ReplyStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ChildAdded {
        sub: String,
        key: String,
        value: Value,
    },
    ChildChanged {
        sub: String,
        key: String,
        value: Value,
    },
    ChildRemoved {
        sub: String,
        key: String,
    },
}

impl ServerFrame {
    pub fn ok(msg_ref: String, key: Option<String>, value: Option<Value>) -> Self {
        ServerFrame::Reply {
            msg_ref,
            status: ReplyStatus::Ok,
            key,
            value,
            message: None,
        }
    }

    pub fn error(msg_ref: String, message: impl Into<String>) -> Self {
        ServerFrame::Reply {
            msg_ref,
            status: ReplyStatus::Error,
            key: None,
            value: None,
            message: Some(message.into()),
        }
    }

    /// Wrap a store child event for subscription `sub`.
    pub fn child(sub: String, event: ChildEvent) -> Self {
        match event {
            ChildEvent::Added { key, value } => ServerFrame::ChildAdded { sub, key, value },
            ChildEvent::Changed { key, value } => ServerFrame::ChildChanged { sub, key, value },
            ChildEvent::Removed { key } => ServerFrame::ChildRemoved { sub, key },
        }
    }
}

// ---------------------------------------------------------------------------
// Events & Commands
// ---------------------------------------------------------------------------

/// Connectivity events emitted by the realtime client.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Connected,
    Disconnected,
    Error(String),
}

/// Successful reply payload.
#[derive(Debug, Default)]
pub(crate) struct ReplyData {
    pub(crate) key: Option<String>,
    pub(crate) value: Option<Value>,
}

pub(crate) type ReplyTx = oneshot::Sender<Result<ReplyData, StoreError>>;

/// Commands sent from [`RealtimeStore`](super::RealtimeStore) handles to the connection task.
#[derive(Debug)]
pub(crate) enum StoreCommand {
    Request {
        op: StoreOp,
        reply: ReplyTx,
    },
    Subscribe {
        sub: String,
        path: String,
        tx: mpsc::UnboundedSender<ChildEvent>,
        reply: ReplyTx,
    },
    Disconnect,
}
