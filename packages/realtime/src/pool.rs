//! Connection pool: load balancing, health scoring, backoff reconnection
//!
//! The pool owns every physical websocket and the 1:1 channel-to-connection
//! routing table. Channels prefer their sticky connection, then the best
//! existing connection by `health - 2 * channel_count` under the per-
//! connection channel cap, then a fresh connection on the least-loaded
//! endpoint. Dropped connections with live channels reconnect on an
//! exponential backoff schedule and resubscribe their channels without
//! caller intervention.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::{PoolConfig, MAX_CHANNELS_PER_CONNECTION};
use crate::connection::{Connection, SocketState};
use crate::error::{RealtimeError, RealtimeResult};
use crate::wire::{self, WireMessage};

/// Idle time before the health tick applies its penalty
const IDLE_PENALTY_THRESHOLD_MS: i64 = 60_000;
/// Average latency above which the health tick penalizes
const SLOW_LATENCY_MS: f64 = 1000.0;
/// Average latency below which the health tick rewards
const FAST_LATENCY_MS: f64 = 100.0;
/// Connections below this health with no channels are evicted
const EVICTION_HEALTH: f64 = 20.0;
/// Rolling metrics snapshots retained
const METRICS_HISTORY: usize = 60;

/// An inbound frame surfaced to the owning backend's dispatcher
#[derive(Debug)]
pub struct InboundEvent {
    pub connection_id: Uuid,
    pub message: WireMessage,
}

/// Aggregate pool metrics, snapshotted each health tick
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub timestamp: i64,
    pub total_connections: usize,
    pub connected_connections: usize,
    pub total_channels: usize,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub average_latency_ms: Option<f64>,
    pub average_health: f64,
    /// Channel fan-out per connection id
    pub channels_per_connection: HashMap<Uuid, usize>,
}

/// Pool of physical websocket connections across multiple endpoints
pub struct ConnectionPool {
    config: PoolConfig,
    endpoints: Vec<String>,
    connections: DashMap<Uuid, Arc<Connection>>,
    /// 1:1 channel-to-connection routing table
    routing: DashMap<String, Uuid>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    history: Mutex<VecDeque<PoolMetrics>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool; the receiver carries inbound frames for the backend
    pub fn new(
        endpoints: Vec<String>,
        config: PoolConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundEvent>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            config,
            endpoints,
            connections: DashMap::new(),
            routing: DashMap::new(),
            inbound,
            history: Mutex::new(VecDeque::with_capacity(METRICS_HISTORY)),
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });
        (pool, rx)
    }

    /// Start the background health and ping loops
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let health_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                if pool.shutting_down.load(Ordering::Relaxed) {
                    return;
                }
                pool.health_tick();
            }
        });

        let weak = Arc::downgrade(self);
        let interval = self.config.ping_interval;
        let ping_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would probe sockets still handshaking
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                if pool.shutting_down.load(Ordering::Relaxed) {
                    return;
                }
                pool.ping_connections();
            }
        });

        let mut tasks = self.tasks.lock().expect("pool lock poisoned");
        tasks.push(health_task);
        tasks.push(ping_task);
    }

    /// Route a channel to a connection, assigning one if needed, and send
    /// the subscribe frame for fresh assignments. Idempotent: repeated calls
    /// for a routed channel return the same connection.
    pub async fn subscribe_channel(self: &Arc<Self>, channel: &str) -> RealtimeResult<Arc<Connection>> {
        if let Some(conn) = self.routed_connection(channel) {
            return Ok(conn);
        }
        let conn = self.assign(channel).await?;
        conn.send_wire(&WireMessage::Subscribe {
            channel: channel.to_string(),
        })?;
        tracing::debug!(
            channel = %channel,
            connection_id = %conn.id,
            "channel subscribed"
        );
        Ok(conn)
    }

    /// Drop a channel's routing entry and tell the server
    pub fn unsubscribe_channel(&self, channel: &str) {
        let Some((_, id)) = self.routing.remove(channel) else {
            return;
        };
        if let Some(conn) = self.connections.get(&id) {
            conn.remove_channel(channel);
            let _ = conn.send_wire(&WireMessage::Unsubscribe {
                channel: channel.to_string(),
            });
            tracing::debug!(channel = %channel, connection_id = %conn.id, "channel unsubscribed");
        }
    }

    /// The connection currently serving a channel, assigning one if needed
    pub async fn connection_for_channel(
        self: &Arc<Self>,
        channel: &str,
    ) -> RealtimeResult<Arc<Connection>> {
        if let Some(conn) = self.routed_connection(channel) {
            return Ok(conn);
        }
        self.assign(channel).await
    }

    /// Open a connection eagerly so `is_connected` reflects transport health
    /// before the first subscribe
    pub async fn ensure_connection(self: &Arc<Self>) -> RealtimeResult<Arc<Connection>> {
        if let Some(conn) = self
            .connections
            .iter()
            .map(|e| e.value().clone())
            .find(|c| c.is_connected())
        {
            return Ok(conn);
        }
        let endpoint = self.least_loaded_endpoint().ok_or(RealtimeError::PoolExhausted)?;
        self.open_connection(&endpoint).await
    }

    pub fn has_connected(&self) -> bool {
        self.connections.iter().any(|e| e.value().is_connected())
    }

    /// Mean latency across connections with at least one sample
    pub fn average_latency(&self) -> Option<f64> {
        let samples: Vec<f64> = self
            .connections
            .iter()
            .filter_map(|e| e.value().metrics.average_latency())
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Aggregate metrics computed now
    pub fn metrics(&self) -> PoolMetrics {
        let mut metrics = PoolMetrics {
            timestamp: chrono::Utc::now().timestamp_millis(),
            total_connections: 0,
            connected_connections: 0,
            total_channels: self.routing.len(),
            messages_in: 0,
            messages_out: 0,
            bytes_in: 0,
            bytes_out: 0,
            average_latency_ms: self.average_latency(),
            average_health: 0.0,
            channels_per_connection: HashMap::new(),
        };

        let mut health_sum = 0.0;
        for entry in self.connections.iter() {
            let conn = entry.value();
            let snapshot = conn.metrics.snapshot();
            metrics.total_connections += 1;
            if conn.is_connected() {
                metrics.connected_connections += 1;
            }
            metrics.messages_in += snapshot.messages_in;
            metrics.messages_out += snapshot.messages_out;
            metrics.bytes_in += snapshot.bytes_in;
            metrics.bytes_out += snapshot.bytes_out;
            metrics
                .channels_per_connection
                .insert(conn.id, conn.channel_count());
            health_sum += conn.health();
        }
        if metrics.total_connections > 0 {
            metrics.average_health = health_sum / metrics.total_connections as f64;
        }
        metrics
    }

    /// Rolling buffer of the last 60 health-tick snapshots
    pub fn metrics_history(&self) -> Vec<PoolMetrics> {
        self.history
            .lock()
            .expect("pool lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close every connection and stop background tasks
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        for task in self.tasks.lock().expect("pool lock poisoned").drain(..) {
            task.abort();
        }
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.routing.clear();
        self.connections.clear();
        tracing::info!("connection pool shut down");
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    fn routed_connection(&self, channel: &str) -> Option<Arc<Connection>> {
        let id = *self.routing.get(channel)?;
        let conn = self.connections.get(&id)?.clone();
        if conn.is_connected() {
            Some(conn)
        } else {
            None
        }
    }

    /// Pick a connection for an unrouted channel per the selection policy
    async fn assign(self: &Arc<Self>, channel: &str) -> RealtimeResult<Arc<Connection>> {
        // Best existing connection with spare channel capacity
        let best = self
            .connections
            .iter()
            .map(|e| e.value().clone())
            .filter(|c| c.is_connected() && c.channel_count() < MAX_CHANNELS_PER_CONNECTION)
            .max_by(|a, b| a.routing_score().total_cmp(&b.routing_score()));
        if let Some(conn) = best {
            self.bind(channel, &conn);
            return Ok(conn);
        }

        // Grow the pool on the least-loaded endpoint
        if self.connections.len() < self.config.max_connections {
            if let Some(endpoint) = self.least_loaded_endpoint() {
                let conn = self.open_connection(&endpoint).await?;
                self.bind(channel, &conn);
                return Ok(conn);
            }
        }

        // Pool is full: overload the healthiest connection rather than fail
        let fallback = self
            .connections
            .iter()
            .map(|e| e.value().clone())
            .filter(|c| c.is_connected())
            .max_by(|a, b| a.health().total_cmp(&b.health()));
        match fallback {
            Some(conn) => {
                tracing::warn!(
                    channel = %channel,
                    connection_id = %conn.id,
                    channels = conn.channel_count(),
                    "pool full, overloading healthiest connection"
                );
                self.bind(channel, &conn);
                Ok(conn)
            }
            None => Err(RealtimeError::PoolExhausted),
        }
    }

    fn bind(&self, channel: &str, conn: &Arc<Connection>) {
        conn.add_channel(channel);
        self.routing.insert(channel.to_string(), conn.id);
    }

    /// Endpoint holding the fewest connections, respecting the per-endpoint cap
    fn least_loaded_endpoint(&self) -> Option<String> {
        let mut counts: HashMap<&str, usize> =
            self.endpoints.iter().map(|e| (e.as_str(), 0)).collect();
        for entry in self.connections.iter() {
            if let Some(count) = counts.get_mut(entry.value().endpoint.as_str()) {
                *count += 1;
            }
        }
        self.endpoints
            .iter()
            .filter(|e| counts[e.as_str()] < self.config.max_connections_per_endpoint)
            .min_by_key(|e| counts[e.as_str()])
            .cloned()
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn open_connection(self: &Arc<Self>, endpoint: &str) -> RealtimeResult<Arc<Connection>> {
        let deadline = self.config.connection_timeout;
        let (stream, _response) = timeout(deadline, connect_async(endpoint))
            .await
            .map_err(|_| RealtimeError::ConnectionTimeout {
                endpoint: endpoint.to_string(),
                timeout_ms: deadline.as_millis() as u64,
            })?
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(endpoint.to_string(), tx));
        self.connections.insert(conn.id, conn.clone());
        self.spawn_io_tasks(conn.clone(), stream, rx);
        tracing::info!(connection_id = %conn.id, endpoint = %endpoint, "connection opened");
        Ok(conn)
    }

    /// Reopen the transport for an existing connection id and resubscribe
    /// its channels
    async fn reopen(self: &Arc<Self>, conn: &Arc<Connection>) -> RealtimeResult<()> {
        let deadline = self.config.connection_timeout;
        let (stream, _response) = timeout(deadline, connect_async(conn.endpoint.as_str()))
            .await
            .map_err(|_| RealtimeError::ConnectionTimeout {
                endpoint: conn.endpoint.clone(),
                timeout_ms: deadline.as_millis() as u64,
            })?
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        conn.replace_sender(tx);
        conn.set_state(SocketState::Connected);
        conn.reset_reconnect_attempts();
        conn.reset_health();
        self.spawn_io_tasks(conn.clone(), stream, rx);

        for channel in self.reclaim_channels(conn) {
            conn.send_wire(&WireMessage::Subscribe { channel })?;
        }
        Ok(())
    }

    /// Channels this connection should resubscribe after a reopen
    ///
    /// A channel rerouted to another live connection while this one was down
    /// stays with its new owner and is released from this connection's set.
    fn reclaim_channels(&self, conn: &Arc<Connection>) -> Vec<String> {
        let mut reclaimed = Vec::new();
        for channel in conn.channels() {
            if self
                .routed_connection(&channel)
                .is_some_and(|owner| owner.id != conn.id)
            {
                tracing::debug!(
                    connection_id = %conn.id,
                    channel = %channel,
                    "channel rerouted while disconnected, releasing"
                );
                conn.remove_channel(&channel);
                continue;
            }
            self.routing.insert(channel.clone(), conn.id);
            reclaimed.push(channel);
        }
        reclaimed
    }

    fn spawn_io_tasks(
        self: &Arc<Self>,
        conn: Arc<Connection>,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        let (mut ws_sender, mut ws_receiver) = stream.split();

        // Writer: owns the sink, drains the connection's outbound channel
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if ws_sender.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader: parses frames, keeps metrics, answers pings, and hands
        // application frames to the backend dispatcher
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        conn.metrics.record_inbound(text.len());
                        match WireMessage::from_text(&text) {
                            Ok(message) => handle_frame(&pool, &conn, message),
                            Err(e) => {
                                tracing::debug!(
                                    connection_id = %conn.id,
                                    error = %e,
                                    "dropping malformed frame"
                                );
                            }
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        conn.metrics.record_inbound(bytes.len());
                        match wire::decode_frame(&bytes) {
                            Ok(messages) => {
                                for message in messages {
                                    handle_frame(&pool, &conn, message);
                                }
                            }
                            Err(e) => {
                                tracing::debug!(
                                    connection_id = %conn.id,
                                    error = %e,
                                    "dropping undecodable binary frame"
                                );
                            }
                        }
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => conn.metrics.touch(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(connection_id = %conn.id, error = %e, "websocket error");
                        break;
                    }
                }
            }

            if let Some(pool) = pool.upgrade() {
                pool.handle_disconnect(conn);
            }
        });
    }

    /// React to a dropped connection: clear routing, then either schedule a
    /// backoff reconnect (channels remain and attempts are left) or remove
    /// the connection permanently
    fn handle_disconnect(self: &Arc<Self>, conn: Arc<Connection>) {
        if conn.state() == SocketState::Connected {
            conn.set_state(SocketState::Disconnected);
        }
        for channel in conn.channels() {
            self.routing
                .remove_if(&channel, |_, routed| *routed == conn.id);
        }

        if self.shutting_down.load(Ordering::Relaxed) {
            self.connections.remove(&conn.id);
            return;
        }

        if conn.channel_count() == 0
            || conn.reconnect_attempts() >= self.config.max_reconnect_attempts
        {
            self.connections.remove(&conn.id);
            tracing::info!(
                connection_id = %conn.id,
                endpoint = %conn.endpoint,
                "connection removed"
            );
            return;
        }

        tracing::warn!(
            connection_id = %conn.id,
            endpoint = %conn.endpoint,
            channels = conn.channel_count(),
            "connection dropped, scheduling reconnect"
        );
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.reconnect_loop(conn).await;
        });
    }

    async fn reconnect_loop(self: Arc<Self>, conn: Arc<Connection>) {
        loop {
            let attempts = conn.reconnect_attempts();
            if attempts >= self.config.max_reconnect_attempts {
                self.connections.remove(&conn.id);
                tracing::error!(
                    connection_id = %conn.id,
                    endpoint = %conn.endpoint,
                    attempts,
                    "reconnect attempts exhausted, removing connection"
                );
                return;
            }

            let delay = backoff_delay(&self.config, attempts);
            conn.record_reconnect_attempt();
            tokio::time::sleep(delay).await;
            if self.shutting_down.load(Ordering::Relaxed) {
                return;
            }

            match self.reopen(&conn).await {
                Ok(()) => {
                    tracing::info!(
                        connection_id = %conn.id,
                        endpoint = %conn.endpoint,
                        channels = conn.channel_count(),
                        "reconnected and resubscribed"
                    );
                    return;
                }
                Err(e) => {
                    conn.set_state(SocketState::Failed);
                    tracing::warn!(
                        connection_id = %conn.id,
                        endpoint = %conn.endpoint,
                        attempt = conn.reconnect_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "reconnect failed"
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    fn health_tick(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut evicted = Vec::new();

        for entry in self.connections.iter() {
            let conn = entry.value();
            if !conn.is_connected() {
                continue;
            }
            if conn.metrics.idle_ms(now) > IDLE_PENALTY_THRESHOLD_MS {
                conn.adjust_health(-5.0);
            }
            if let Some(avg) = conn.metrics.average_latency() {
                if avg > SLOW_LATENCY_MS {
                    conn.adjust_health(-10.0);
                } else if avg < FAST_LATENCY_MS {
                    conn.adjust_health(5.0);
                }
            }
            if conn.health() < EVICTION_HEALTH && conn.channel_count() == 0 {
                evicted.push(conn.clone());
            }
        }

        for conn in evicted {
            tracing::info!(
                connection_id = %conn.id,
                health = conn.health(),
                "evicting unhealthy idle connection"
            );
            conn.close();
            self.connections.remove(&conn.id);
        }

        let snapshot = self.metrics();
        let mut history = self.history.lock().expect("pool lock poisoned");
        if history.len() >= METRICS_HISTORY {
            history.pop_front();
        }
        history.push_back(snapshot);
    }

    fn ping_connections(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        for entry in self.connections.iter() {
            let conn = entry.value();
            if !conn.is_connected() {
                continue;
            }
            conn.begin_ping();
            let _ = conn.send_wire(&WireMessage::Ping {
                timestamp: Some(now),
            });
        }
    }
}

/// Reply to protocol frames the pool handles itself; forward the rest
fn handle_frame(pool: &Weak<ConnectionPool>, conn: &Arc<Connection>, message: WireMessage) {
    match message {
        WireMessage::Ping { timestamp } => {
            let _ = conn.send_wire(&WireMessage::Pong { timestamp });
        }
        WireMessage::Pong { .. } => conn.complete_ping(),
        other => {
            if let Some(pool) = pool.upgrade() {
                let _ = pool.inbound.send(InboundEvent {
                    connection_id: conn.id,
                    message: other,
                });
            }
        }
    }
}

/// Exponential backoff: `initial * multiplier^attempts`, capped
pub(crate) fn backoff_delay(config: &PoolConfig, attempts: u32) -> Duration {
    let factor = config.reconnect_multiplier.powi(attempts as i32);
    let delay = config.reconnect_initial_delay.as_secs_f64() * factor;
    Duration::from_secs_f64(delay.min(config.reconnect_max_delay.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PoolConfig {
        PoolConfig {
            max_connections: 4,
            max_connections_per_endpoint: 2,
            ..PoolConfig::default()
        }
    }

    /// A connection record with a live dummy writer, never backed by a socket
    fn fake_connection(endpoint: &str) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Connection::new(endpoint.to_string(), tx)), rx)
    }

    #[test]
    fn test_backoff_delay_schedule() {
        let config = PoolConfig {
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_multiplier: 2.0,
            ..PoolConfig::default()
        };

        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(8));
        // Capped at the maximum
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_reclaim_releases_channels_rerouted_while_down() {
        let (pool, _rx) = ConnectionPool::new(vec!["ws://a".into()], test_config());
        let (downed, _d) = fake_connection("ws://a");
        let (live, _l) = fake_connection("ws://a");
        downed.set_state(SocketState::Disconnected);
        downed.add_channel("tournament-42");
        downed.add_channel("match-m1");
        live.add_channel("tournament-42");
        pool.connections.insert(downed.id, downed.clone());
        pool.connections.insert(live.id, live.clone());
        pool.routing.insert("tournament-42".to_string(), live.id);
        pool.routing.insert("match-m1".to_string(), downed.id);

        let reclaimed = pool.reclaim_channels(&downed);

        assert_eq!(reclaimed, vec!["match-m1".to_string()]);
        assert!(!downed.serves("tournament-42"));
        assert!(downed.serves("match-m1"));
        assert_eq!(*pool.routing.get("tournament-42").unwrap(), live.id);
        assert_eq!(*pool.routing.get("match-m1").unwrap(), downed.id);
    }

    #[tokio::test]
    async fn test_assign_prefers_highest_routing_score() {
        let (pool, _rx) = ConnectionPool::new(vec!["ws://a".into()], test_config());
        let (healthy, _h) = fake_connection("ws://a");
        let (loaded, _l) = fake_connection("ws://a");
        for i in 0..10 {
            loaded.add_channel(&format!("ch-{i}"));
        }
        pool.connections.insert(healthy.id, healthy.clone());
        pool.connections.insert(loaded.id, loaded.clone());

        let picked = pool.assign("tournament-42").await.unwrap();
        assert_eq!(picked.id, healthy.id);
        assert!(healthy.serves("tournament-42"));
        assert_eq!(*pool.routing.get("tournament-42").unwrap(), healthy.id);
    }

    #[tokio::test]
    async fn test_assign_skips_connections_at_channel_cap() {
        let (pool, _rx) = ConnectionPool::new(
            vec!["ws://a".into()],
            PoolConfig {
                max_connections: 2,
                ..test_config()
            },
        );
        let (full, _f) = fake_connection("ws://a");
        for i in 0..MAX_CHANNELS_PER_CONNECTION {
            full.add_channel(&format!("ch-{i}"));
        }
        let (open, _o) = fake_connection("ws://a");
        open.adjust_health(-50.0); // worse score but has capacity
        pool.connections.insert(full.id, full.clone());
        pool.connections.insert(open.id, open.clone());

        let picked = pool.assign("tournament-42").await.unwrap();
        assert_eq!(picked.id, open.id);
    }

    #[tokio::test]
    async fn test_full_pool_overloads_healthiest() {
        let (pool, _rx) = ConnectionPool::new(
            vec!["ws://a".into()],
            PoolConfig {
                max_connections: 1,
                ..test_config()
            },
        );
        let (only, _o) = fake_connection("ws://a");
        for i in 0..MAX_CHANNELS_PER_CONNECTION {
            only.add_channel(&format!("ch-{i}"));
        }
        pool.connections.insert(only.id, only.clone());

        // At the cap, but the pool cannot grow: the channel lands here anyway
        let picked = pool.assign("tournament-42").await.unwrap();
        assert_eq!(picked.id, only.id);
        assert_eq!(only.channel_count(), MAX_CHANNELS_PER_CONNECTION + 1);
    }

    #[tokio::test]
    async fn test_empty_full_pool_is_exhausted() {
        let (pool, _rx) = ConnectionPool::new(
            vec!["ws://a".into()],
            PoolConfig {
                max_connections: 0,
                ..test_config()
            },
        );

        let result = pool.assign("tournament-42").await;
        assert!(matches!(result, Err(RealtimeError::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let (pool, _rx) = ConnectionPool::new(vec!["ws://a".into()], test_config());
        let (conn, _writer) = fake_connection("ws://a");
        pool.connections.insert(conn.id, conn.clone());

        let first = pool.subscribe_channel("tournament-42").await.unwrap();
        let second = pool.subscribe_channel("tournament-42").await.unwrap();
        let third = pool.subscribe_channel("tournament-42").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.id, third.id);
        assert_eq!(conn.channel_count(), 1);
        assert_eq!(pool.routing.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_routing() {
        let (pool, _rx) = ConnectionPool::new(vec!["ws://a".into()], test_config());
        let (conn, _writer) = fake_connection("ws://a");
        pool.connections.insert(conn.id, conn.clone());

        pool.subscribe_channel("tournament-42").await.unwrap();
        pool.unsubscribe_channel("tournament-42");

        assert!(pool.routing.get("tournament-42").is_none());
        assert_eq!(conn.channel_count(), 0);
    }

    #[test]
    fn test_least_loaded_endpoint_respects_caps() {
        let (pool, _rx) = ConnectionPool::new(
            vec!["ws://a".into(), "ws://b".into()],
            PoolConfig {
                max_connections_per_endpoint: 1,
                ..test_config()
            },
        );
        let (on_a, _a) = fake_connection("ws://a");
        pool.connections.insert(on_a.id, on_a);

        assert_eq!(pool.least_loaded_endpoint().as_deref(), Some("ws://b"));

        let (on_b, _b) = fake_connection("ws://b");
        pool.connections.insert(on_b.id, on_b);
        assert_eq!(pool.least_loaded_endpoint(), None);
    }

    #[tokio::test]
    async fn test_health_tick_penalties_and_clamping() {
        let (pool, _rx) = ConnectionPool::new(vec!["ws://a".into()], test_config());
        let (conn, _writer) = fake_connection("ws://a");
        conn.add_channel("keepalive");
        conn.metrics.record_latency(2000.0);
        pool.connections.insert(conn.id, conn.clone());

        for _ in 0..50 {
            pool.health_tick();
        }

        // Repeated slow-latency penalties floor at zero, never below
        assert_eq!(conn.health(), 0.0);
        assert!((0.0..=100.0).contains(&conn.health()));
        // The connection still owns a channel, so it is not evicted
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_health_tick_evicts_unhealthy_idle_connection() {
        let (pool, _rx) = ConnectionPool::new(vec!["ws://a".into()], test_config());
        let (conn, _writer) = fake_connection("ws://a");
        conn.metrics.record_latency(5000.0);
        pool.connections.insert(conn.id, conn.clone());

        for _ in 0..20 {
            pool.health_tick();
        }

        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_metrics_history_is_bounded() {
        let (pool, _rx) = ConnectionPool::new(vec!["ws://a".into()], test_config());
        let (conn, _writer) = fake_connection("ws://a");
        conn.add_channel("keepalive");
        pool.connections.insert(conn.id, conn);

        for _ in 0..100 {
            pool.health_tick();
        }

        assert_eq!(pool.metrics_history().len(), METRICS_HISTORY);
    }
}
