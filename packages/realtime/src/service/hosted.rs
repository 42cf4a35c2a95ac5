//! Hosted pub/sub provider adapter
//!
//! One websocket to the managed provider, built from the configured key,
//! cluster, and host. Provider specifics stay inside this module; callers
//! see the uniform service contract. A synthetic ping rides the shared
//! global channel every 30 seconds purely to keep a latency sample warm.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashSet;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{ConnectionState, StateChange, StateTracker, GLOBAL_CHANNEL};
use crate::config::HostedConfig;
use crate::connection::ConnectionMetrics;
use crate::dedup::Deduplicator;
use crate::error::{RealtimeError, RealtimeResult};
use crate::rooms::{PresenceMember, RoomRouter};
use crate::wire::WireMessage;

/// Interval between synthetic latency pings
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Window during which redelivered provider events are suppressed
const DEDUP_TTL: Duration = Duration::from_secs(5);

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

pub struct HostedBackend {
    inner: Arc<HostedInner>,
}

struct HostedInner {
    config: HostedConfig,
    router: Arc<RoomRouter>,
    dedup: Deduplicator,
    state: StateTracker,
    metrics: ConnectionMetrics,
    /// Write handle into the current socket's writer task
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    subscribed: DashSet<String>,
    pending_ping: Mutex<Option<Instant>>,
    reconnect_attempts: AtomicU32,
    ping_loop_started: AtomicBool,
    suppress_reconnect: AtomicBool,
    /// True while a backoff reconnect loop is running
    reconnect_scheduled: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl HostedBackend {
    pub fn new(config: HostedConfig) -> Self {
        Self {
            inner: Arc::new(HostedInner {
                config,
                router: Arc::new(RoomRouter::new()),
                dedup: Deduplicator::new(DEDUP_TTL),
                state: StateTracker::new(),
                metrics: ConnectionMetrics::default(),
                sender: Mutex::new(None),
                subscribed: DashSet::new(),
                pending_ping: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                ping_loop_started: AtomicBool::new(false),
                suppress_reconnect: AtomicBool::new(false),
                reconnect_scheduled: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn router(&self) -> Arc<RoomRouter> {
        Arc::clone(&self.inner.router)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn on_state_change(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state.subscribe()
    }

    pub async fn connect(&self) -> RealtimeResult<()> {
        self.inner.suppress_reconnect.store(false, Ordering::Relaxed);
        // A caller-driven connect restores the full retry budget
        self.inner.reconnect_attempts.store(0, Ordering::Relaxed);
        self.inner.connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub async fn subscribe_channel(&self, channel: &str) -> RealtimeResult<()> {
        self.inner.router.ensure_room_for_channel(channel);
        self.inner.subscribed.insert(channel.to_string());
        if self.state() != ConnectionState::Connected {
            return self.connect().await;
        }
        self.inner.send(&WireMessage::Subscribe {
            channel: channel.to_string(),
        })
    }

    pub async fn unsubscribe_channel(&self, channel: &str) {
        self.inner.subscribed.remove(channel);
        let _ = self.inner.send(&WireMessage::Unsubscribe {
            channel: channel.to_string(),
        });
    }

    /// Publish immediately; the provider has no outbound buffering here
    pub async fn trigger(&self, channel: &str, event: &str, data: Value) -> RealtimeResult<()> {
        self.inner
            .send(&WireMessage::message(channel, event, data))
            .map_err(|_| {
                RealtimeError::MessageDeliveryFailed(format!(
                    "hosted transport not connected, dropping {event} on {channel}"
                ))
            })
    }

    pub fn metrics(&self) -> Value {
        json!({
            "backend": "hosted",
            "connected": self.state() == ConnectionState::Connected,
            "cluster": self.inner.config.cluster,
            "transport": self.inner.metrics.snapshot(),
        })
    }

    pub fn latency(&self) -> Option<f64> {
        self.inner.metrics.average_latency()
    }

    pub async fn shutdown(&self) {
        self.inner.disconnect();
        for task in self.inner.tasks.lock().expect("backend lock poisoned").drain(..) {
            task.abort();
        }
    }
}

impl HostedInner {
    fn provider_url(&self) -> String {
        format!(
            "wss://{}/app/{}?cluster={}",
            self.config.host, self.config.key, self.config.cluster
        )
    }

    async fn connect(self: &Arc<Self>) -> RealtimeResult<()> {
        if self.state.current() == ConnectionState::Connected {
            return Ok(());
        }
        self.state.transition(ConnectionState::Connecting);

        let url = self.provider_url();
        let deadline = self.config.connect_timeout;
        let result = timeout(deadline, connect_async(&url))
            .await
            .map_err(|_| RealtimeError::ConnectionTimeout {
                endpoint: url.clone(),
                timeout_ms: deadline.as_millis() as u64,
            })
            .and_then(|r| r.map_err(|e| RealtimeError::ConnectionFailed(e.to_string())));

        let (stream, _response) = match result {
            Ok(ok) => ok,
            Err(e) => {
                self.state.transition(ConnectionState::Failed);
                self.schedule_reconnect();
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().expect("backend lock poisoned") = Some(tx);
        self.spawn_io_tasks(stream, rx);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.state.transition(ConnectionState::Connected);
        tracing::info!(cluster = %self.config.cluster, "hosted realtime connected");

        // The shared global channel carries the synthetic latency pings
        self.subscribed.insert(GLOBAL_CHANNEL.to_string());
        let channels: Vec<String> = self.subscribed.iter().map(|c| c.key().clone()).collect();
        for channel in channels {
            if let Err(e) = self.send(&WireMessage::Subscribe {
                channel: channel.clone(),
            }) {
                tracing::warn!(channel = %channel, error = %e, "resubscribe failed");
            }
        }
        self.start_ping_loop();
        Ok(())
    }

    fn disconnect(&self) {
        if self.state.current() == ConnectionState::Disconnected {
            return;
        }
        self.suppress_reconnect.store(true, Ordering::Relaxed);
        self.state.transition(ConnectionState::Disconnecting);
        if let Some(sender) = self.sender.lock().expect("backend lock poisoned").take() {
            let _ = sender.send(Message::Close(None));
        }
        self.state.transition(ConnectionState::Disconnected);
    }

    fn send(&self, message: &WireMessage) -> RealtimeResult<()> {
        let text = message.to_text()?;
        let sender = self.sender.lock().expect("backend lock poisoned");
        match sender.as_ref() {
            Some(tx) => {
                self.metrics.record_outbound(text.len());
                tx.send(Message::Text(text)).map_err(|_| {
                    RealtimeError::ConnectionFailed("write channel closed".to_string())
                })
            }
            None => Err(RealtimeError::ConnectionFailed(
                "not connected".to_string(),
            )),
        }
    }

    fn spawn_io_tasks(
        self: &Arc<Self>,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        let (mut ws_sender, mut ws_receiver) = stream.split();

        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if ws_sender.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        let backend = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let Some(inner) = backend.upgrade() else { return };
                match frame {
                    Ok(Message::Text(text)) => {
                        inner.metrics.record_inbound(text.len());
                        match WireMessage::from_text(&text) {
                            Ok(message) => inner.handle_frame(message),
                            Err(e) => {
                                tracing::debug!(error = %e, "dropping malformed provider frame");
                            }
                        }
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => inner.metrics.touch(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "provider websocket error");
                        break;
                    }
                }
            }
            if let Some(inner) = backend.upgrade() {
                inner.handle_socket_closed();
            }
        });
    }

    fn handle_frame(&self, message: WireMessage) {
        match message {
            WireMessage::Message {
                channel,
                event,
                data,
                ..
            } => {
                super::dispatch_inbound(&self.router, &self.dedup, &channel, &event, data);
            }
            WireMessage::Ping { timestamp } => {
                let _ = self.send(&WireMessage::Pong { timestamp });
            }
            WireMessage::Pong { .. } => {
                let started = self
                    .pending_ping
                    .lock()
                    .expect("backend lock poisoned")
                    .take();
                if let Some(started) = started {
                    self.metrics
                        .record_latency(started.elapsed().as_secs_f64() * 1000.0);
                }
            }
            WireMessage::Connected { channel, data } => {
                let Some(channel) = channel else { return };
                self.router.ensure_room_for_channel(&channel);
                let members = data
                    .as_ref()
                    .and_then(|d| d.get("members"))
                    .cloned()
                    .and_then(|m| serde_json::from_value::<Vec<PresenceMember>>(m).ok());
                if let Some(members) = members {
                    self.router.seed_members(&channel, members);
                }
            }
            WireMessage::Error { data } => {
                tracing::warn!(data = ?data, "provider reported an error");
            }
            _ => {}
        }
    }

    fn handle_socket_closed(self: &Arc<Self>) {
        if self.suppress_reconnect.load(Ordering::Relaxed) {
            return;
        }
        if self.state.current() == ConnectionState::Connected {
            self.state.transition(ConnectionState::Disconnected);
        }
        *self.sender.lock().expect("backend lock poisoned") = None;
        tracing::warn!("hosted realtime dropped, scheduling reconnect");
        self.schedule_reconnect();
    }

    /// Start the backoff reconnect loop; covers both dropped sockets and a
    /// failed first connect. At most one loop runs at a time.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.suppress_reconnect.load(Ordering::Relaxed) {
            return;
        }
        if self.reconnect_scheduled.swap(true, Ordering::Relaxed) {
            return;
        }
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.reconnect_loop().await;
        });
        self.tasks
            .lock()
            .expect("backend lock poisoned")
            .push(task);
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let attempts = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            if attempts >= MAX_RECONNECT_ATTEMPTS {
                tracing::error!(attempts, "hosted reconnect attempts exhausted, giving up");
                self.state.transition(ConnectionState::Failed);
                self.reconnect_scheduled.store(false, Ordering::Relaxed);
                return;
            }

            let factor = 2f64.powi(attempts as i32);
            let delay = Duration::from_secs_f64(
                (RECONNECT_INITIAL_DELAY.as_secs_f64() * factor)
                    .min(RECONNECT_MAX_DELAY.as_secs_f64()),
            );
            tokio::time::sleep(delay).await;
            if self.suppress_reconnect.load(Ordering::Relaxed) {
                self.reconnect_scheduled.store(false, Ordering::Relaxed);
                return;
            }

            match self.connect().await {
                Ok(()) => {
                    tracing::info!("hosted realtime reconnected");
                    self.reconnect_scheduled.store(false, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempts + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "hosted reconnect failed"
                    );
                }
            }
        }
    }

    fn start_ping_loop(self: &Arc<Self>) {
        if self.ping_loop_started.swap(true, Ordering::Relaxed) {
            return;
        }
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                if inner.state.current() != ConnectionState::Connected {
                    continue;
                }
                *inner.pending_ping.lock().expect("backend lock poisoned") =
                    Some(Instant::now());
                let _ = inner.send(&WireMessage::Ping {
                    timestamp: Some(chrono::Utc::now().timestamp_millis()),
                });
            }
        });
        self.tasks
            .lock()
            .expect("backend lock poisoned")
            .push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HostedBackend {
        HostedBackend::new(HostedConfig {
            key: "app-key".to_string(),
            cluster: "us2".to_string(),
            host: "realtime.courtside.live".to_string(),
            connect_timeout: Duration::from_millis(100),
        })
    }

    #[test]
    fn test_provider_url_shape() {
        let backend = backend();
        assert_eq!(
            backend.inner.provider_url(),
            "wss://realtime.courtside.live/app/app-key?cluster=us2"
        );
    }

    #[tokio::test]
    async fn test_failed_connect_schedules_reconnect_loop() {
        let backend = backend();

        assert!(backend.connect().await.is_err());

        assert_eq!(backend.state(), ConnectionState::Failed);
        assert!(backend.inner.reconnect_scheduled.load(Ordering::Relaxed));

        // A clean disconnect cancels the pending loop
        backend.disconnect().await;
        assert!(backend.inner.suppress_reconnect.load(Ordering::Relaxed));
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_without_connection_fails() {
        let backend = backend();

        let result = backend
            .trigger("tournament-42", "score-update", json!({"points": 3}))
            .await;
        assert!(matches!(
            result,
            Err(RealtimeError::MessageDeliveryFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_frames_fan_out_and_sample_latency() {
        let backend = backend();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits_inner = Arc::clone(&hits);
        let guard = backend.router().subscribe(
            "tournament-42",
            &[crate::rooms::WILDCARD],
            Arc::new(move |_| {
                hits_inner.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        backend.inner.handle_frame(WireMessage::message(
            "tournament-42",
            "score-update",
            json!({"points": 3}),
        ));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);

        assert!(backend.latency().is_none());
        *backend.inner.pending_ping.lock().unwrap() = Some(Instant::now());
        backend
            .inner
            .handle_frame(WireMessage::Pong { timestamp: Some(1) });
        assert!(backend.latency().is_some());

        guard.unsubscribe();
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_names_the_cluster() {
        let backend = backend();
        let metrics = backend.metrics();
        assert_eq!(metrics["backend"], "hosted");
        assert_eq!(metrics["cluster"], "us2");
        assert_eq!(metrics["connected"], false);
    }
}
