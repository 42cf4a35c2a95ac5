//! Mock realtime websocket server
//!
//! Speaks the flat JSON wire protocol the realtime transport uses:
//! subscribe/connected acks (with a presence roster seed for `presence-`
//! channels), ping/pong, and message echo to every subscriber of the
//! channel. Binary frames carrying the magic-tagged zlib batch envelope are
//! unpacked and handled like individual text frames. `disconnect_all` force
//! closes every client so reconnect paths can be exercised.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use flate2::read::ZlibDecoder;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

/// Magic header marking a compressed binary batch envelope
const BINARY_MAGIC: [u8; 2] = [0xFF, 0xFE];

/// Capacity of the per-channel fan-out channels
const CHANNEL_CAPACITY: usize = 256;

struct ServerState {
    /// Per-channel fan-out of serialized frames
    channels: DashMap<String, broadcast::Sender<String>>,
    /// Signal that force-closes every live client socket
    kick: broadcast::Sender<()>,
    connections: AtomicUsize,
    messages: AtomicUsize,
}

impl ServerState {
    fn channel_sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// Mock realtime websocket endpoint for transport tests
///
/// # Example
///
/// ```rust,ignore
/// use courtside_test_utils::MockRealtimeServer;
///
/// #[tokio::test]
/// async fn test_realtime() {
///     let server = MockRealtimeServer::start().await;
///     // Point your realtime endpoints at server.url()
/// }
/// ```
pub struct MockRealtimeServer {
    state: Arc<ServerState>,
    addr: SocketAddr,
    server_task: tokio::task::JoinHandle<()>,
}

impl MockRealtimeServer {
    /// Start a server on an ephemeral local port
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0".parse().expect("loopback address")).await
    }

    /// Start a server on a specific address, for tests that take an endpoint
    /// down and bring it back
    pub async fn start_on(addr: SocketAddr) -> Self {
        let (kick, _) = broadcast::channel(1);
        let state = Arc::new(ServerState {
            channels: DashMap::new(),
            kick,
            connections: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("bind mock realtime server");
        let addr = listener.local_addr().expect("mock server address");
        let server_task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).into_future().await;
        });

        Self {
            state,
            addr,
            server_task,
        }
    }

    /// Websocket URL clients should connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of currently open client connections
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Total `message` frames received, batched envelopes unpacked
    pub fn message_count(&self) -> usize {
        self.state.messages.load(Ordering::SeqCst)
    }

    /// Force close every live client socket
    pub fn disconnect_all(&self) {
        let _ = self.state.kick.send(());
    }

    /// Push a server-originated event to every subscriber of a channel
    pub fn publish(&self, channel: &str, event: &str, data: Value) {
        let frame = json!({
            "type": "message",
            "channel": channel,
            "event": event,
            "data": data,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        let _ = self.state.channel_sender(channel).send(frame.to_string());
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<ServerState>, socket: WebSocket) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut kick = state.kick.subscribe();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if ws_sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = kick.recv() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Per-connection forwarding tasks, one per subscribed channel
    let mut subscriptions: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();
    while let Some(Ok(frame)) = ws_receiver.next().await {
        match frame {
            Message::Text(text) => {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    handle_frame(&state, &tx, &mut subscriptions, value);
                }
            }
            Message::Binary(bytes) => {
                for value in decode_batch(&bytes) {
                    handle_frame(&state, &tx, &mut subscriptions, value);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    for task in subscriptions.into_values() {
        task.abort();
    }
    writer.abort();
    state.connections.fetch_sub(1, Ordering::SeqCst);
}

fn handle_frame(
    state: &Arc<ServerState>,
    tx: &mpsc::UnboundedSender<String>,
    subscriptions: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    value: Value,
) {
    match value.get("type").and_then(Value::as_str) {
        Some("subscribe") => {
            let Some(channel) = value.get("channel").and_then(Value::as_str) else {
                return;
            };
            if !subscriptions.contains_key(channel) {
                let mut feed = state.channel_sender(channel).subscribe();
                let tx = tx.clone();
                let task = tokio::spawn(async move {
                    loop {
                        match feed.recv().await {
                            Ok(text) => {
                                if tx.send(text).is_err() {
                                    return;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                });
                subscriptions.insert(channel.to_string(), task);
            }

            let data = if channel.starts_with("presence-") {
                json!({
                    "members": [
                        {"id": "roster-seed", "joined_at": chrono::Utc::now().timestamp_millis()}
                    ]
                })
            } else {
                Value::Null
            };
            let ack = json!({"type": "connected", "channel": channel, "data": data});
            let _ = tx.send(ack.to_string());
        }
        Some("unsubscribe") => {
            if let Some(channel) = value.get("channel").and_then(Value::as_str) {
                if let Some(task) = subscriptions.remove(channel) {
                    task.abort();
                }
            }
        }
        Some("ping") => {
            let pong = json!({
                "type": "pong",
                "timestamp": value.get("timestamp").cloned().unwrap_or(Value::Null),
            });
            let _ = tx.send(pong.to_string());
        }
        Some("message") => {
            state.messages.fetch_add(1, Ordering::SeqCst);
            if let Some(channel) = value.get("channel").and_then(Value::as_str) {
                let _ = state.channel_sender(channel).send(value.to_string());
            }
        }
        _ => {}
    }
}

/// Unpack an inbound binary payload into individual frames
fn decode_batch(bytes: &[u8]) -> Vec<Value> {
    if !bytes.starts_with(&BINARY_MAGIC) {
        return serde_json::from_slice::<Value>(bytes)
            .map(|v| vec![v])
            .unwrap_or_default();
    }
    let mut decoder = ZlibDecoder::new(&bytes[BINARY_MAGIC.len()..]);
    let mut json = Vec::new();
    if decoder.read_to_end(&mut json).is_err() {
        tracing::debug!("dropping undecodable binary envelope");
        return Vec::new();
    }
    serde_json::from_slice::<Vec<Value>>(&json).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn recv_json(
        stream: &mut (impl StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    ) -> Value {
        loop {
            match stream.next().await.expect("frame").expect("ok frame") {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_ack_and_echo() {
        let server = MockRealtimeServer::start().await;
        let (stream, _) = connect_async(server.url()).await.unwrap();
        let (mut tx, mut rx) = stream.split();

        tx.send(WsMessage::Text(
            json!({"type": "subscribe", "channel": "tournament-42"}).to_string(),
        ))
        .await
        .unwrap();
        let ack = recv_json(&mut rx).await;
        assert_eq!(ack["type"], "connected");
        assert_eq!(ack["channel"], "tournament-42");

        tx.send(WsMessage::Text(
            json!({
                "type": "message",
                "channel": "tournament-42",
                "event": "score-update",
                "data": {"points": 3}
            })
            .to_string(),
        ))
        .await
        .unwrap();

        let echo = recv_json(&mut rx).await;
        assert_eq!(echo["event"], "score-update");
        assert_eq!(echo["data"]["points"], 3);
        assert_eq!(server.message_count(), 1);
    }

    #[tokio::test]
    async fn test_presence_subscribe_seeds_roster() {
        let server = MockRealtimeServer::start().await;
        let (stream, _) = connect_async(server.url()).await.unwrap();
        let (mut tx, mut rx) = stream.split();

        tx.send(WsMessage::Text(
            json!({"type": "subscribe", "channel": "presence-court-1"}).to_string(),
        ))
        .await
        .unwrap();

        let ack = recv_json(&mut rx).await;
        assert_eq!(ack["data"]["members"][0]["id"], "roster-seed");
    }

    #[tokio::test]
    async fn test_ping_pong_round_trip() {
        let server = MockRealtimeServer::start().await;
        let (stream, _) = connect_async(server.url()).await.unwrap();
        let (mut tx, mut rx) = stream.split();

        tx.send(WsMessage::Text(
            json!({"type": "ping", "timestamp": 42}).to_string(),
        ))
        .await
        .unwrap();

        let pong = recv_json(&mut rx).await;
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["timestamp"], 42);
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_clients() {
        let server = MockRealtimeServer::start().await;
        let (stream, _) = connect_async(server.url()).await.unwrap();
        let (_tx, mut rx) = stream.split();

        // Wait for the connection to register before kicking
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 1);
        server.disconnect_all();

        loop {
            match rx.next().await {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    }
}
