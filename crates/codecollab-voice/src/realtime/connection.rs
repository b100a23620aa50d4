//! Background WebSocket connection loop with auto-reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::handler::handle_server_frame;
use super::types::{
    ClientFrame, RealtimeConfig, RealtimeEvent, ReplyTx, ServerFrame, StoreCommand, StoreOp,
};
use crate::store::{ChildEvent, StoreError};

// ---------------------------------------------------------------------------
// Ref Counter
// ---------------------------------------------------------------------------

/// Monotonically increasing ref counter for client frames.
static REF_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_ref() -> String {
    REF_COUNTER.fetch_add(1, Ordering::Relaxed).to_string()
}

/// A live subscription, re-sent to the relay on every reconnect.
pub(crate) struct ActiveSubscription {
    pub(crate) path: String,
    pub(crate) tx: mpsc::UnboundedSender<ChildEvent>,
}

pub(crate) type Pending = Arc<Mutex<HashMap<String, ReplyTx>>>;
pub(crate) type Subscriptions = Arc<RwLock<HashMap<String, ActiveSubscription>>>;

async fn send_frame<S>(writer: &Mutex<S>, msg_ref: String, op: StoreOp) -> bool
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let frame = ClientFrame { msg_ref, op };
    match serde_json::to_string(&frame) {
        Ok(json) => writer.lock().await.send(WsMessage::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode client frame");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Connection Loop
// ---------------------------------------------------------------------------

/// Background task managing the WebSocket connection with auto-reconnect.
pub(crate) async fn connection_loop(
    config: RealtimeConfig,
    connected: Arc<RwLock<bool>>,
    event_tx: mpsc::Sender<RealtimeEvent>,
    command_rx: mpsc::Receiver<StoreCommand>,
) {
    let command_rx = Arc::new(Mutex::new(command_rx));
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashMap::new()));
    let mut reconnect_delay = config.reconnect_delay_secs;

    loop {
        info!(url = %config.url, "Connecting to store relay");

        match tokio::time::timeout(
            Duration::from_secs(15),
            tokio_tungstenite::connect_async(config.url.as_str()),
        )
        .await
        {
            Ok(Ok((ws_stream, _))) => {
                reconnect_delay = config.reconnect_delay_secs;
                *connected.write().await = true;
                let _ = event_tx.send(RealtimeEvent::Connected).await;

                let (ws_write, ws_read) = ws_stream.split();
                let ws_write = Arc::new(Mutex::new(ws_write));
                let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

                // Re-establish live subscriptions.
                {
                    let subs = subscriptions.read().await;
                    for (sub, active) in subs.iter() {
                        let op = StoreOp::Subscribe {
                            path: active.path.clone(),
                            sub: sub.clone(),
                        };
                        send_frame(&ws_write, next_ref(), op).await;
                    }
                    if !subs.is_empty() {
                        debug!(count = subs.len(), "Resubscribed after connect");
                    }
                }

                let ping_handle = tokio::spawn(ping_task(
                    Arc::clone(&ws_write),
                    config.ping_interval_secs,
                    Arc::clone(&subscriptions),
                ));

                let mut cmd_handle = tokio::spawn(command_forwarder(
                    Arc::clone(&command_rx),
                    Arc::clone(&ws_write),
                    Arc::clone(&subscriptions),
                    Arc::clone(&pending),
                ));

                // Process incoming frames until the socket drops or the
                // forwarder exits on Disconnect.
                let mut read_stream = ws_read;
                let mut shutdown = false;
                loop {
                    tokio::select! {
                        msg = read_stream.next() => match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<ServerFrame>(&text) {
                                    Ok(frame) => {
                                        if let Some(stale) =
                                            handle_server_frame(frame, &pending, &subscriptions).await
                                        {
                                            send_frame(&ws_write, next_ref(), StoreOp::Unsubscribe { sub: stale }).await;
                                        }
                                    }
                                    Err(_) => debug!(text = %text, "Unrecognized frame from relay"),
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                info!("Store relay closed connection");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "WebSocket error");
                                break;
                            }
                            Some(Ok(_)) => {}
                        },
                        exit = &mut cmd_handle => {
                            shutdown = exit.unwrap_or(true);
                            break;
                        }
                    }
                }

                // Cleanup.
                ping_handle.abort();
                cmd_handle.abort();
                fail_pending(&pending).await;
                *connected.write().await = false;
                let _ = event_tx.send(RealtimeEvent::Disconnected).await;
                if shutdown {
                    info!("Store client shut down");
                    return;
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to connect to store relay");
                let _ = event_tx
                    .send(RealtimeEvent::Error(format!("Connection failed: {e}")))
                    .await;
            }
            Err(_elapsed) => {
                error!("WebSocket connection timed out after 15s");
                let _ = event_tx
                    .send(RealtimeEvent::Error(
                        "Connection timed out after 15s".to_string(),
                    ))
                    .await;
            }
        }

        // Exponential backoff reconnect.
        info!(
            delay = reconnect_delay,
            "Reconnecting in {} seconds", reconnect_delay
        );
        let stop = wait_offline(
            Duration::from_secs(reconnect_delay),
            &command_rx,
            &subscriptions,
        )
        .await;
        if stop {
            info!("Store client shut down while offline");
            return;
        }
        reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay_secs);
    }
}

async fn fail_pending(pending: &Pending) {
    for (_, reply) in pending.lock().await.drain() {
        let _ = reply.send(Err(StoreError::Disconnected));
    }
}

/// Serve commands while waiting to reconnect. Requests fail fast;
/// subscriptions are recorded and go live on the next connect.
/// Returns true when the client asked to shut down.
async fn wait_offline(
    delay: Duration,
    command_rx: &Mutex<mpsc::Receiver<StoreCommand>>,
    subscriptions: &Subscriptions,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    let mut rx = command_rx.lock().await;
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = rx.recv() => match cmd {
                None | Some(StoreCommand::Disconnect) => return true,
                Some(StoreCommand::Request { reply, .. }) => {
                    let _ = reply.send(Err(StoreError::Disconnected));
                }
                Some(StoreCommand::Subscribe { sub, path, tx, reply }) => {
                    subscriptions
                        .write()
                        .await
                        .insert(sub, ActiveSubscription { path, tx });
                    let _ = reply.send(Ok(Default::default()));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Keepalive
// ---------------------------------------------------------------------------

/// Ping the relay periodically and drop subscriptions nobody listens to.
async fn ping_task<S>(ws_write: Arc<Mutex<S>>, interval_secs: u64, subscriptions: Subscriptions)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.tick().await;
    loop {
        interval.tick().await;
        if !send_frame(&ws_write, next_ref(), StoreOp::Ping).await {
            break;
        }

        let closed: Vec<String> = {
            let mut subs = subscriptions.write().await;
            let closed: Vec<String> = subs
                .iter()
                .filter(|(_, active)| active.tx.is_closed())
                .map(|(sub, _)| sub.clone())
                .collect();
            for sub in &closed {
                subs.remove(sub);
            }
            closed
        };
        for sub in closed {
            send_frame(&ws_write, next_ref(), StoreOp::Unsubscribe { sub }).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Command Forwarder
// ---------------------------------------------------------------------------

/// Forward client commands onto the socket. Returns true on shutdown,
/// false if the socket stopped accepting writes.
async fn command_forwarder<S>(
    cmd_rx: Arc<Mutex<mpsc::Receiver<StoreCommand>>>,
    cmd_write: Arc<Mutex<S>>,
    subscriptions: Subscriptions,
    pending: Pending,
) -> bool
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut rx = cmd_rx.lock().await;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::Request { op, reply } => {
                let msg_ref = next_ref();
                pending.lock().await.insert(msg_ref.clone(), reply);
                if !send_frame(&cmd_write, msg_ref.clone(), op).await {
                    if let Some(reply) = pending.lock().await.remove(&msg_ref) {
                        let _ = reply.send(Err(StoreError::Disconnected));
                    }
                    return false;
                }
            }
            StoreCommand::Subscribe {
                sub,
                path,
                tx,
                reply,
            } => {
                subscriptions.write().await.insert(
                    sub.clone(),
                    ActiveSubscription {
                        path: path.clone(),
                        tx,
                    },
                );
                let msg_ref = next_ref();
                pending.lock().await.insert(msg_ref.clone(), reply);
                if !send_frame(&cmd_write, msg_ref.clone(), StoreOp::Subscribe { path, sub }).await {
                    // Stays registered; the next connect subscribes it.
                    if let Some(reply) = pending.lock().await.remove(&msg_ref) {
                        let _ = reply.send(Ok(Default::default()));
                    }
                    return false;
                }
            }
            StoreCommand::Disconnect => {
                let mut writer = cmd_write.lock().await;
                let _ = writer.send(WsMessage::Close(None)).await;
                return true;
            }
        }
    }
    // Every handle was dropped.
    true
}
