//! Per-connection handler: decode store operations, apply them, reply.

use std::collections::HashMap;
use std::net::SocketAddr;

use codecollab_voice::{
    ClientFrame, KvStore, MemoryStore, ServerFrame, StoreError, StoreOp, StoreSubscription,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

/// Child events waiting to be written to one client.
const OUTBOUND_BUFFER: usize = 256;

/// Handle a single WebSocket connection until the client goes away.
pub async fn handle_connection(ws: WebSocketStream<TcpStream>, addr: SocketAddr, store: MemoryStore) {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);
    // Subscription id -> task forwarding that subscription's child events.
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    tracing::info!(peer = %addr, "Client connected");

    loop {
        tokio::select! {
            Some(frame) = out_rx.recv() => {
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => apply(&store, frame, &out_tx, &mut subscriptions).await,
                            Err(e) => match frame_ref(&text) {
                                Some(msg_ref) => ServerFrame::error(msg_ref, format!("invalid frame: {e}")),
                                None => {
                                    tracing::warn!(peer = %addr, error = %e, "Unreadable client frame");
                                    continue;
                                }
                            },
                        };
                        if send_frame(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(peer = %addr, error = %e, "WS error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    for (_, task) in subscriptions.drain() {
        task.abort();
    }
    tracing::info!(peer = %addr, "Client disconnected");
}

/// Apply one client operation to the store and build its reply.
async fn apply(
    store: &MemoryStore,
    frame: ClientFrame,
    out_tx: &mpsc::Sender<ServerFrame>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
) -> ServerFrame {
    let ClientFrame { msg_ref, op } = frame;
    let result: Result<(Option<String>, Option<Value>), StoreError> = match op {
        StoreOp::Write { path, value } => store.write(&path, value).await.map(|()| (None, None)),
        StoreOp::Append { path, value } => store
            .append(&path, value)
            .await
            .map(|key| (Some(key), None)),
        StoreOp::Read { path } => store.read(&path).await.map(|value| (None, value)),
        StoreOp::Remove { path } => store.remove(&path).await.map(|()| (None, None)),
        StoreOp::Subscribe { path, sub } => match store.subscribe(&path).await {
            Ok(subscription) => {
                tracing::debug!(sub = %sub, path = %path, "Subscribed");
                let task = tokio::spawn(forward_children(
                    sub.clone(),
                    subscription,
                    out_tx.clone(),
                ));
                if let Some(previous) = subscriptions.insert(sub, task) {
                    previous.abort();
                }
                Ok((None, None))
            }
            Err(e) => Err(e),
        },
        StoreOp::Unsubscribe { sub } => {
            if let Some(task) = subscriptions.remove(&sub) {
                task.abort();
                tracing::debug!(sub = %sub, "Unsubscribed");
            }
            Ok((None, None))
        }
        StoreOp::Ping => Ok((None, None)),
    };

    match result {
        Ok((key, value)) => ServerFrame::ok(msg_ref, key, value),
        Err(e) => ServerFrame::error(msg_ref, e.to_string()),
    }
}

/// Relay a store subscription to the client as child frames.
async fn forward_children(
    sub: String,
    mut subscription: StoreSubscription,
    out_tx: mpsc::Sender<ServerFrame>,
) {
    while let Some(event) = subscription.next().await {
        if out_tx.send(ServerFrame::child(sub.clone(), event)).await.is_err() {
            break;
        }
    }
}

/// The `ref` of a frame that failed to decode, if it carried one.
fn frame_ref(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("ref")?.as_str().map(str::to_string)
}

/// Send a ServerFrame as a JSON text frame.
async fn send_frame(
    sink: &mut WsSink,
    frame: &ServerFrame,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode server frame");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use codecollab_voice::{ChildEvent, RealtimeConfig, RealtimeEvent, RealtimeStore, ReplyStatus};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;

    use super::*;
    use crate::server::serve;

    async fn start_relay() -> (String, MemoryStore) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let store = MemoryStore::new();
        tokio::spawn(serve(listener, store.clone()));
        (url, store)
    }

    async fn connect_client(url: &str) -> RealtimeStore {
        let config = RealtimeConfig {
            url: url.to_string(),
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 1,
            ping_interval_secs: 25,
            request_timeout_secs: 5,
        };
        let (client, mut events) = RealtimeStore::connect(config);
        let connected = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if event == RealtimeEvent::Connected {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(connected);
        client
    }

    async fn next_event(sub: &mut StoreSubscription) -> ChildEvent {
        tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn operations_reach_the_shared_store() {
        let (url, store) = start_relay().await;
        let client = connect_client(&url).await;

        client.write("rooms/r1/heartbeat/amy", json!(7)).await.unwrap();
        assert_eq!(
            store.read("rooms/r1/heartbeat/amy").await.unwrap(),
            Some(json!(7))
        );
        assert_eq!(
            client.read("rooms/r1/heartbeat").await.unwrap(),
            Some(json!({"amy": 7}))
        );

        let key = client.append("rooms/r1/signals/amy", json!("x")).await.unwrap();
        assert!(!key.is_empty());

        client.remove("rooms/r1").await.unwrap();
        assert_eq!(client.read("rooms/r1").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn subscriptions_see_other_clients_writes() {
        let (url, _store) = start_relay().await;
        let amy = connect_client(&url).await;
        let bob = connect_client(&url).await;

        let first = bob.append("rooms/r1/signals/amy", json!("offer")).await.unwrap();
        let mut inbox = amy.subscribe("rooms/r1/signals/amy").await.unwrap();
        assert_eq!(
            next_event(&mut inbox).await,
            ChildEvent::Added {
                key: first.clone(),
                value: json!("offer")
            }
        );

        let second = bob.append("rooms/r1/signals/amy", json!("candidate")).await.unwrap();
        assert_eq!(next_event(&mut inbox).await.key(), second);

        amy.remove(&format!("rooms/r1/signals/amy/{first}")).await.unwrap();
        assert_eq!(
            next_event(&mut inbox).await,
            ChildEvent::Removed { key: first }
        );
    }

    #[tokio::test]
    async fn disconnect_stops_forwarding() {
        let (url, store) = start_relay().await;
        let client = connect_client(&url).await;
        let _sub = client.subscribe("rooms/r1/mute").await.unwrap();

        let mut watchers = 0;
        for _ in 0..50 {
            watchers = store.watcher_count().await;
            if watchers == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(watchers, 1);

        client.disconnect().await;
        for _ in 0..50 {
            watchers = store.watcher_count().await;
            if watchers == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(watchers, 0);
    }

    #[tokio::test]
    async fn malformed_frames_get_error_replies() {
        let (url, _store) = start_relay().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        ws.send(Message::Text(
            json!({"ref": "9", "op": "explode"}).to_string().into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(
            json!({"ref": "10", "op": "write", "path": "a//b", "value": 1})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

        let mut replies = Vec::new();
        while replies.len() < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                replies.push(serde_json::from_str::<ServerFrame>(&text).unwrap());
            }
        }
        for (reply, expected_ref) in replies.iter().zip(["9", "10"]) {
            match reply {
                ServerFrame::Reply {
                    msg_ref, status, ..
                } => {
                    assert_eq!(msg_ref, expected_ref);
                    assert_eq!(*status, ReplyStatus::Error);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test]
    fn frame_ref_is_recovered_from_partial_frames() {
        assert_eq!(frame_ref(r#"{"ref":"3","op":"nope"}"#), Some("3".into()));
        assert_eq!(frame_ref("not json"), None);
    }
}
