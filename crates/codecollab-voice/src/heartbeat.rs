//! Liveness records.
//!
//! Each participant keeps `rooms/{room}/heartbeat/{participant}` set to
//! its last-seen wall clock in epoch millis. Room membership logic treats
//! a missing or old record as gone.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use codecollab_common::{now_millis, ParticipantId};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::paths;
use crate::store::{KvStore, StoreError};

/// Periodic writer of one participant's heartbeat record.
pub struct Heartbeat {
    store: Arc<dyn KvStore>,
    path: String,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Write a record now, then refresh it every `interval`.
    pub async fn start(
        store: Arc<dyn KvStore>,
        room_id: &str,
        participant: &ParticipantId,
        interval: Duration,
    ) -> Result<Self, StoreError> {
        let path = paths::heartbeat(room_id, participant);
        store.write(&path, json!(now_millis())).await?;
        info!(room = %room_id, participant = %participant, "Heartbeat started");

        let task = tokio::spawn(refresh_loop(Arc::clone(&store), path.clone(), interval));
        Ok(Self {
            store,
            path,
            task: Some(task),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stop refreshing and delete the record. Once this returns no
    /// further write can land.
    pub async fn stop(mut self) -> Result<(), StoreError> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.store.remove(&self.path).await?;
        info!(path = %self.path, "Heartbeat stopped");
        Ok(())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn refresh_loop(store: Arc<dyn KvStore>, path: String, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; start() already wrote.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.write(&path, json!(now_millis())).await {
            Ok(()) => debug!(path = %path, "Heartbeat refreshed"),
            Err(e) => warn!(path = %path, error = %e, "Heartbeat write failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

/// All heartbeat records in a room. Malformed entries are skipped.
pub async fn read_heartbeats(
    store: &dyn KvStore,
    room_id: &str,
) -> Result<BTreeMap<ParticipantId, i64>, StoreError> {
    let Some(value) = store.read(&paths::heartbeats(room_id)).await? else {
        return Ok(BTreeMap::new());
    };
    let records = value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(id, ts)| ts.as_i64().map(|ts| (ParticipantId::from(id.as_str()), ts)))
                .collect()
        })
        .unwrap_or_default();
    Ok(records)
}

/// Participants whose last heartbeat is older than `stale_after`.
pub fn stale_participants(
    records: &BTreeMap<ParticipantId, i64>,
    now_ms: i64,
    stale_after: Duration,
) -> Vec<ParticipantId> {
    let limit = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
    records
        .iter()
        .filter(|(_, &seen)| now_ms.saturating_sub(seen) > limit)
        .map(|(id, _)| id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn start_writes_immediately_and_refreshes() {
        let store = MemoryStore::new();
        let amy = ParticipantId::from("amy");
        let hb = Heartbeat::start(Arc::new(store.clone()), "r1", &amy, Duration::from_secs(5))
            .await
            .unwrap();

        let first = store.read("rooms/r1/heartbeat/amy").await.unwrap();
        assert!(first.and_then(|v| v.as_i64()).is_some_and(|ts| ts > 0));

        store.write(hb.path(), json!(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5100)).await;
        let refreshed = store.read(hb.path()).await.unwrap().unwrap();
        assert!(refreshed.as_i64().unwrap() > 0);

        hb.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_removes_record_for_good() {
        let store = MemoryStore::new();
        let amy = ParticipantId::from("amy");
        let hb = Heartbeat::start(Arc::new(store.clone()), "r1", &amy, Duration::from_secs(5))
            .await
            .unwrap();

        hb.stop().await.unwrap();
        assert_eq!(store.read("rooms/r1/heartbeat/amy").await.unwrap(), None);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn reads_room_records() {
        let store = MemoryStore::new();
        store.write("rooms/r1/heartbeat/amy", json!(1000)).await.unwrap();
        store.write("rooms/r1/heartbeat/bob", json!(2000)).await.unwrap();
        store.write("rooms/r1/heartbeat/junk", json!("x")).await.unwrap();
        store.write("rooms/r2/heartbeat/cat", json!(3000)).await.unwrap();

        let records = read_heartbeats(&store, "r1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[&ParticipantId::from("bob")], 2000);

        assert!(read_heartbeats(&store, "empty").await.unwrap().is_empty());
    }

    #[test]
    fn stale_after_threshold() {
        let records: BTreeMap<ParticipantId, i64> = [
            ("amy".into(), 100_000),
            ("bob".into(), 85_000),
            ("cat".into(), 84_999),
        ]
        .into_iter()
        .collect();
        let stale = stale_participants(&records, 100_000, Duration::from_secs(15));
        assert_eq!(stale, vec![ParticipantId::from("cat")]);
    }
}
