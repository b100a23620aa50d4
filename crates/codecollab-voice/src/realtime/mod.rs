//! WebSocket client for a remote realtime store.
//!
//! Speaks the JSON frame protocol served by `codecollab-relay` and exposes
//! it as a [`KvStore`](crate::store::KvStore). Handles request/reply
//! correlation, keepalive pings, and auto-reconnect with backoff; live
//! subscriptions are re-established after every reconnect.

mod client;
mod connection;
mod handler;
mod types;

pub use client::RealtimeStore;
pub use types::{ClientFrame, RealtimeConfig, RealtimeEvent, ReplyStatus, ServerFrame, StoreOp};
