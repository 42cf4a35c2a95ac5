//! Per-connection bookkeeping for the pool
//!
//! A [`Connection`] is the pool's record of one physical websocket: its
//! routing state, the channels it serves, rolling traffic metrics, and the
//! 0-100 health score driving routing and eviction decisions. The socket
//! itself lives in the pool's reader/writer tasks; this record holds the
//! write handle.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::{RealtimeError, RealtimeResult};
use crate::wire::WireMessage;

/// Rolling latency window length; bounds how fast one bad sample can move
/// the average the health tick reads
const LATENCY_WINDOW: usize = 50;

/// Lifecycle state of a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Traffic counters and the rolling latency window for one connection
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Unix timestamp ms of the last frame in either direction
    last_activity: AtomicI64,
    latency_samples: Mutex<VecDeque<f64>>,
}

/// Point-in-time copy of one connection's metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub average_latency_ms: Option<f64>,
    pub last_activity: i64,
}

impl ConnectionMetrics {
    pub fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_inbound(&self, bytes: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_outbound(&self, bytes: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_latency(&self, ms: f64) {
        let mut samples = self.latency_samples.lock().expect("metrics lock poisoned");
        if samples.len() >= LATENCY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    /// Mean over the rolling window, `None` until the first sample lands
    pub fn average_latency(&self) -> Option<f64> {
        let samples = self.latency_samples.lock().expect("metrics lock poisoned");
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last frame, relative to `now_ms`
    pub fn idle_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_activity()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            average_latency_ms: self.average_latency(),
            last_activity: self.last_activity(),
        }
    }
}

/// The pool's record of one physical websocket connection
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub endpoint: String,
    state: Mutex<SocketState>,
    /// Write handle into the connection's writer task; swapped on reconnect
    sender: Mutex<mpsc::UnboundedSender<Message>>,
    channels: Mutex<HashSet<String>>,
    pub metrics: ConnectionMetrics,
    reconnect_attempts: AtomicU32,
    health: Mutex<f64>,
    pending_ping: Mutex<Option<Instant>>,
}

impl Connection {
    /// A freshly opened connection starts connected at full health
    pub fn new(endpoint: String, sender: mpsc::UnboundedSender<Message>) -> Self {
        let conn = Self {
            id: Uuid::new_v4(),
            endpoint,
            state: Mutex::new(SocketState::Connected),
            sender: Mutex::new(sender),
            channels: Mutex::new(HashSet::new()),
            metrics: ConnectionMetrics::default(),
            reconnect_attempts: AtomicU32::new(0),
            health: Mutex::new(100.0),
            pending_ping: Mutex::new(None),
        };
        conn.metrics.touch();
        conn
    }

    pub fn state(&self) -> SocketState {
        *self.state.lock().expect("connection lock poisoned")
    }

    pub fn set_state(&self, state: SocketState) {
        *self.state.lock().expect("connection lock poisoned") = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    /// Serialize and send one frame as text
    pub fn send_wire(&self, message: &WireMessage) -> RealtimeResult<()> {
        let text = message.to_text()?;
        self.metrics.record_outbound(text.len());
        self.sender
            .lock()
            .expect("connection lock poisoned")
            .send(Message::Text(text))
            .map_err(|_| RealtimeError::ConnectionFailed("write channel closed".to_string()))
    }

    /// Send a pre-encoded binary envelope
    pub fn send_binary(&self, payload: Vec<u8>) -> RealtimeResult<()> {
        self.metrics.record_outbound(payload.len());
        self.sender
            .lock()
            .expect("connection lock poisoned")
            .send(Message::Binary(payload))
            .map_err(|_| RealtimeError::ConnectionFailed("write channel closed".to_string()))
    }

    /// Install a new write handle after a reconnect
    pub fn replace_sender(&self, sender: mpsc::UnboundedSender<Message>) {
        *self.sender.lock().expect("connection lock poisoned") = sender;
    }

    /// Ask the writer task to close the socket
    pub fn close(&self) {
        self.set_state(SocketState::Disconnected);
        let _ = self
            .sender
            .lock()
            .expect("connection lock poisoned")
            .send(Message::Close(None));
    }

    pub fn add_channel(&self, channel: &str) {
        self.channels
            .lock()
            .expect("connection lock poisoned")
            .insert(channel.to_string());
    }

    pub fn remove_channel(&self, channel: &str) {
        self.channels
            .lock()
            .expect("connection lock poisoned")
            .remove(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().expect("connection lock poisoned").len()
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels
            .lock()
            .expect("connection lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn serves(&self, channel: &str) -> bool {
        self.channels
            .lock()
            .expect("connection lock poisoned")
            .contains(channel)
    }

    pub fn health(&self) -> f64 {
        *self.health.lock().expect("connection lock poisoned")
    }

    /// Apply a health delta, clamped to [0, 100]
    pub fn adjust_health(&self, delta: f64) -> f64 {
        let mut health = self.health.lock().expect("connection lock poisoned");
        *health = (*health + delta).clamp(0.0, 100.0);
        *health
    }

    pub fn reset_health(&self) {
        *self.health.lock().expect("connection lock poisoned") = 100.0;
    }

    /// Routing rank: health discounted by current fan-out load
    pub fn routing_score(&self) -> f64 {
        self.health() - 2.0 * self.channel_count() as f64
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn record_reconnect_attempt(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_reconnect_attempts(&self) {
        self.reconnect_attempts.store(0, Ordering::Relaxed);
    }

    /// Mark an outstanding latency probe
    pub fn begin_ping(&self) {
        *self.pending_ping.lock().expect("connection lock poisoned") = Some(Instant::now());
    }

    /// Resolve the outstanding probe into a latency sample
    pub fn complete_ping(&self) {
        let started = self
            .pending_ping
            .lock()
            .expect("connection lock poisoned")
            .take();
        if let Some(started) = started {
            self.metrics
                .record_latency(started.elapsed().as_secs_f64() * 1000.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        let (tx, _rx) = mpsc::unbounded_channel();
        Connection::new("ws://localhost:9100".to_string(), tx)
    }

    #[test]
    fn test_new_connection_starts_healthy() {
        let conn = connection();
        assert_eq!(conn.health(), 100.0);
        assert!(conn.is_connected());
        assert_eq!(conn.reconnect_attempts(), 0);
    }

    #[test]
    fn test_health_clamps_to_bounds() {
        let conn = connection();

        for _ in 0..50 {
            conn.adjust_health(-10.0);
        }
        assert_eq!(conn.health(), 0.0);

        for _ in 0..100 {
            conn.adjust_health(5.0);
        }
        assert_eq!(conn.health(), 100.0);
    }

    #[test]
    fn test_routing_score_discounts_load() {
        let conn = connection();
        assert_eq!(conn.routing_score(), 100.0);

        conn.add_channel("tournament-1");
        conn.add_channel("tournament-2");
        assert_eq!(conn.routing_score(), 96.0);

        conn.remove_channel("tournament-1");
        assert_eq!(conn.routing_score(), 98.0);
    }

    #[test]
    fn test_channel_membership() {
        let conn = connection();
        conn.add_channel("match-m1");
        conn.add_channel("match-m1");

        assert_eq!(conn.channel_count(), 1);
        assert!(conn.serves("match-m1"));
        assert!(!conn.serves("match-m2"));
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let conn = connection();
        for i in 0..200 {
            conn.metrics.record_latency(i as f64);
        }
        // Window holds the last 50 samples: 150..200, mean 174.5
        let avg = conn.metrics.average_latency().unwrap();
        assert!((avg - 174.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_send_after_writer_gone_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new("ws://localhost:9100".to_string(), tx);
        drop(rx);

        let result = conn.send_wire(&WireMessage::Ping { timestamp: None });
        assert!(matches!(result, Err(RealtimeError::ConnectionFailed(_))));
    }

    #[test]
    fn test_ping_round_trip_records_latency() {
        let conn = connection();
        assert!(conn.metrics.average_latency().is_none());

        conn.begin_ping();
        conn.complete_ping();
        assert!(conn.metrics.average_latency().is_some());

        // A pong with no outstanding probe is ignored
        conn.complete_ping();
    }
}
