//! Inbound relay frame dispatch.

use tracing::{debug, warn};

use super::connection::{Pending, Subscriptions};
use super::types::{ReplyData, ReplyStatus, ServerFrame};
use crate::store::{ChildEvent, StoreError};

/// Handle a single frame from the relay.
///
/// Returns the id of a subscription whose listener has gone away so the
/// caller can unsubscribe it upstream.
pub(crate) async fn handle_server_frame(
    frame: ServerFrame,
    pending: &Pending,
    subscriptions: &Subscriptions,
) -> Option<String> {
    let (sub, event) = match frame {
        ServerFrame::Reply {
            msg_ref,
            status,
            key,
            value,
            message,
        } => {
            let Some(reply) = pending.lock().await.remove(&msg_ref) else {
                // Pings and resubscribes are fire-and-forget.
                if status == ReplyStatus::Error {
                    warn!(msg_ref = %msg_ref, message = ?message, "Relay rejected request");
                }
                return None;
            };
            let result = match status {
                ReplyStatus::Ok => Ok(ReplyData { key, value }),
                ReplyStatus::Error => Err(StoreError::Rejected(
                    message.unwrap_or_else(|| "unknown error".to_string()),
                )),
            };
            let _ = reply.send(result);
            return None;
        }
        ServerFrame::ChildAdded { sub, key, value } => (sub, ChildEvent::Added { key, value }),
        ServerFrame::ChildChanged { sub, key, value } => (sub, ChildEvent::Changed { key, value }),
        ServerFrame::ChildRemoved { sub, key } => (sub, ChildEvent::Removed { key }),
    };

    let mut subs = subscriptions.write().await;
    let Some(active) = subs.get(&sub) else {
        debug!(sub = %sub, "Child event for unknown subscription");
        return Some(sub);
    };
    if active.tx.send(event).is_err() {
        subs.remove(&sub);
        return Some(sub);
    }
    None
}
