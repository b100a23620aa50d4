//! Removes participants whose heartbeat has gone stale.
//!
//! A client that crashes never gets to clean up after itself. Once its
//! heartbeat is older than the staleness window, the relay drops the
//! heartbeat, the published mute flag and the signal mailbox.

use std::time::Duration;

use codecollab_common::now_millis;
use codecollab_voice::protocol::paths;
use codecollab_voice::{read_heartbeats, stale_participants, KvStore, MemoryStore, StoreError};
use serde_json::Value;

/// One sweep over every room. Returns how many participants were reaped.
pub async fn reap_once(
    store: &MemoryStore,
    stale_after: Duration,
    now_ms: i64,
) -> Result<usize, StoreError> {
    let Some(Value::Object(rooms)) = store.read("rooms").await? else {
        return Ok(0);
    };

    let mut reaped = 0;
    for room_id in rooms.keys() {
        let records = read_heartbeats(store, room_id).await?;
        for participant in stale_participants(&records, now_ms, stale_after) {
            tracing::info!(room = %room_id, participant = %participant, "Reaping stale participant");
            store.remove(&paths::heartbeat(room_id, &participant)).await?;
            store.remove(&paths::mute(room_id, &participant)).await?;
            store.remove(&paths::mailbox(room_id, &participant)).await?;
            reaped += 1;
        }
    }
    Ok(reaped)
}

/// Sweep every `interval` until the task is dropped.
pub async fn run_reaper(store: MemoryStore, interval: Duration, stale_after: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match reap_once(&store, stale_after, now_millis()).await {
            Ok(0) => {}
            Ok(count) => tracing::debug!(reaped = count, "Reaper tick"),
            Err(e) => tracing::warn!(error = %e, "Reaper sweep failed"),
        }
    }
}
