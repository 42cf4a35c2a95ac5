//! Pooled raw-socket backend
//!
//! Composes the connection pool, room router, outbound queue, and inbound
//! deduplicator. Triggers land in the priority queue and are drained on
//! each flush tick; batches at or above the configured threshold go out as
//! one compressed binary envelope. Inbound frames arrive from the pool's
//! reader tasks and fan out through the router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashSet;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, RwLock};

use super::{ConnectionState, StateChange, StateTracker};
use crate::config::PooledConfig;
use crate::dedup::Deduplicator;
use crate::error::RealtimeResult;
use crate::pool::{backoff_delay, ConnectionPool, InboundEvent};
use crate::queue::{MessageQueue, Priority, QueueEvent, QueuedMessage};
use crate::rooms::{PresenceMember, RoomRouter};
use crate::wire::{self, WireMessage};

pub struct PooledBackend {
    inner: Arc<PooledInner>,
}

struct PooledInner {
    config: PooledConfig,
    router: Arc<RoomRouter>,
    queue: MessageQueue,
    dedup: Deduplicator,
    state: StateTracker,
    /// `None` while disconnected; rebuilt on connect
    pool: RwLock<Option<Arc<ConnectionPool>>>,
    /// Channels the caller subscribed, replayed after every (re)connect
    subscribed: DashSet<String>,
    /// True while an unattended connect-retry loop is running
    retry_scheduled: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PooledBackend {
    pub fn new(config: PooledConfig) -> Self {
        let inner = Arc::new(PooledInner {
            dedup: Deduplicator::new(config.dedup_ttl),
            queue: MessageQueue::new(config.queue.clone()),
            config,
            router: Arc::new(RoomRouter::new()),
            state: StateTracker::new(),
            pool: RwLock::new(None),
            subscribed: DashSet::new(),
            retry_scheduled: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        spawn_flush_loop(&inner);
        Self { inner }
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
        self.inner.connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    pub async fn subscribe_channel(&self, channel: &str) -> RealtimeResult<()> {
        self.inner.subscribe_channel(channel).await
    }

    pub async fn unsubscribe_channel(&self, channel: &str) {
        self.inner.unsubscribe_channel(channel).await
    }

    /// Queue an outbound event; delivery happens on the next flush
    pub fn trigger(
        &self,
        channel: &str,
        event: &str,
        data: Value,
        priority: Priority,
    ) -> RealtimeResult<()> {
        let message = QueuedMessage::new(channel, event, data).with_priority(priority);
        self.inner.queue.enqueue(message);
        Ok(())
    }

    pub fn metrics(&self) -> Value {
        let pool = self
            .inner
            .pool
            .try_read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|p| p.metrics()));
        json!({
            "backend": "pooled",
            "connected": self.state() == ConnectionState::Connected,
            "queue": self.inner.queue.stats(),
            "pool": pool,
        })
    }

    pub fn latency(&self) -> Option<f64> {
        self.inner
            .pool
            .try_read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|p| p.average_latency()))
    }

    pub async fn shutdown(&self) {
        self.inner.queue.shutdown();
        if let Some(pool) = self.inner.pool.write().await.take() {
            pool.shutdown();
        }
        for task in self.inner.tasks.lock().expect("backend lock poisoned").drain(..) {
            task.abort();
        }
        self.inner.state.transition(ConnectionState::Disconnected);
    }
}

impl PooledInner {
    async fn connect(self: &Arc<Self>) -> RealtimeResult<()> {
        if self.state.current() == ConnectionState::Connected {
            return Ok(());
        }
        self.state.transition(ConnectionState::Connecting);

        let pool = self.ensure_pool().await;
        if let Err(e) = pool.ensure_connection().await {
            self.state.transition(ConnectionState::Failed);
            self.schedule_retry();
            return Err(e);
        }
        self.state.transition(ConnectionState::Connected);

        let channels: Vec<String> = self.subscribed.iter().map(|c| c.key().clone()).collect();
        for channel in channels {
            if let Err(e) = pool.subscribe_channel(&channel).await {
                tracing::warn!(channel = %channel, error = %e, "resubscribe failed");
            }
        }
        Ok(())
    }

    /// Retry a failed connect unattended, on the pool's backoff schedule
    ///
    /// The pool's own reconnect loop only covers sockets that opened and then
    /// dropped; this covers the endpoint being down at first contact. At most
    /// one loop runs at a time.
    fn schedule_retry(self: &Arc<Self>) {
        if self.retry_scheduled.swap(true, Ordering::Relaxed) {
            return;
        }
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.retry_loop().await;
        });
        self.tasks
            .lock()
            .expect("backend lock poisoned")
            .push(task);
    }

    async fn retry_loop(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        loop {
            if attempts >= self.config.pool.max_reconnect_attempts {
                tracing::error!(attempts, "connect retries exhausted, giving up");
                self.retry_scheduled.store(false, Ordering::Relaxed);
                return;
            }
            let delay = backoff_delay(&self.config.pool, attempts);
            attempts += 1;
            tokio::time::sleep(delay).await;

            match self.state.current() {
                // Resolved or torn down while we slept
                ConnectionState::Connected
                | ConnectionState::Disconnecting
                | ConnectionState::Disconnected => {
                    self.retry_scheduled.store(false, Ordering::Relaxed);
                    return;
                }
                _ => {}
            }

            match self.connect().await {
                Ok(()) => {
                    tracing::info!(attempt = attempts, "connect retry succeeded");
                    self.retry_scheduled.store(false, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connect retry failed"
                    );
                }
            }
        }
    }

    async fn disconnect(&self) {
        if self.state.current() == ConnectionState::Disconnected {
            return;
        }
        self.state.transition(ConnectionState::Disconnecting);
        if let Some(pool) = self.pool.write().await.take() {
            pool.shutdown();
        }
        self.state.transition(ConnectionState::Disconnected);
    }

    async fn subscribe_channel(self: &Arc<Self>, channel: &str) -> RealtimeResult<()> {
        self.router.ensure_room_for_channel(channel);
        self.subscribed.insert(channel.to_string());

        // First subscribe brings the transport up; connect replays the
        // subscribed set, this channel included
        if self.state.current() != ConnectionState::Connected {
            return self.connect().await;
        }
        let pool = self.ensure_pool().await;
        pool.subscribe_channel(channel).await?;
        Ok(())
    }

    async fn unsubscribe_channel(&self, channel: &str) {
        self.subscribed.remove(channel);
        if let Some(pool) = self.pool.read().await.as_ref() {
            pool.unsubscribe_channel(channel);
        }
    }

    /// The live pool, building one (with its inbound dispatcher) if needed
    async fn ensure_pool(self: &Arc<Self>) -> Arc<ConnectionPool> {
        let mut slot = self.pool.write().await;
        if let Some(pool) = slot.as_ref() {
            return Arc::clone(pool);
        }
        let (pool, inbound) =
            ConnectionPool::new(self.config.endpoints.clone(), self.config.pool.clone());
        pool.start();
        self.spawn_inbound(inbound);
        *slot = Some(Arc::clone(&pool));
        pool
    }

    fn spawn_inbound(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundEvent>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.handle_inbound(event.message);
            }
        });
        self.tasks
            .lock()
            .expect("backend lock poisoned")
            .push(task);
    }

    fn handle_inbound(&self, message: WireMessage) {
        match message {
            WireMessage::Message {
                channel,
                event,
                data,
                ..
            } => {
                super::dispatch_inbound(&self.router, &self.dedup, &channel, &event, data);
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
                tracing::warn!(data = ?data, "server reported an error");
            }
            // Protocol frames are answered inside the pool and never reach here
            _ => {}
        }
    }

    /// Drain the queue into the pool; skipped while the transport is down
    /// so queued messages wait for the reconnect instead of burning retries
    async fn drain_queue(&self) {
        if self.state.current() != ConnectionState::Connected {
            return;
        }
        let pool = match self.pool.read().await.as_ref() {
            Some(pool) => Arc::clone(pool),
            None => return,
        };
        if !pool.has_connected() {
            return;
        }

        let threshold = self.config.binary_batch_threshold;
        self.queue
            .process_queue(|batch| {
                let pool = Arc::clone(&pool);
                async move { send_batch(pool, threshold, batch).await }
            })
            .await;
    }
}

/// Send one batch, grouped per channel; batches at or above the threshold
/// go out as a single compressed binary envelope
async fn send_batch(
    pool: Arc<ConnectionPool>,
    threshold: usize,
    batch: Vec<QueuedMessage>,
) -> bool {
    let mut by_channel: HashMap<String, Vec<WireMessage>> = HashMap::new();
    for message in batch {
        let frame = WireMessage::Message {
            channel: message.channel.clone(),
            event: message.event,
            data: message.data,
            timestamp: Some(message.timestamp),
        };
        by_channel.entry(message.channel).or_default().push(frame);
    }

    for (channel, frames) in by_channel {
        let conn = match pool.connection_for_channel(&channel).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "no connection for outbound batch");
                return false;
            }
        };
        let sent = if frames.len() >= threshold {
            wire::encode_batch(&frames).and_then(|envelope| conn.send_binary(envelope))
        } else {
            frames.iter().try_for_each(|frame| conn.send_wire(frame))
        };
        if let Err(e) = sent {
            tracing::warn!(channel = %channel, error = %e, "outbound batch send failed");
            return false;
        }
    }
    true
}

fn spawn_flush_loop(inner: &Arc<PooledInner>) {
    // Tests constructing the backend outside a runtime drive drains manually
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };

    let weak = Arc::downgrade(inner);
    let mut events = inner.queue.events();
    let task = handle.spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Flush) => {
                    let Some(inner) = weak.upgrade() else { return };
                    inner.drain_queue().await;
                }
                Ok(QueueEvent::Failed { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "flush loop lagged behind queue events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    inner
        .tasks
        .lock()
        .expect("backend lock poisoned")
        .push(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> PooledConfig {
        let mut config = PooledConfig {
            // A closed local port so connects fail fast instead of hanging
            endpoints: vec!["ws://127.0.0.1:9".to_string()],
            ..PooledConfig::default()
        };
        config.pool.connection_timeout = Duration::from_millis(500);
        config
    }

    #[tokio::test]
    async fn test_trigger_queues_without_transport() {
        let backend = PooledBackend::new(test_config());

        backend
            .trigger("tournament-42", "score-update", json!({"points": 3}), Priority::High)
            .unwrap();
        backend
            .trigger("tournament-42", "leaderboard", json!({}), Priority::Low)
            .unwrap();

        let stats = backend.inner.queue.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.high, 1);
        assert_eq!(stats.low, 1);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_connect_transitions_to_failed() {
        let backend = PooledBackend::new(test_config());
        let mut changes = backend.on_state_change();

        assert!(backend.connect().await.is_err());

        assert_eq!(backend.state(), ConnectionState::Failed);
        assert_eq!(changes.try_recv().unwrap().current, ConnectionState::Connecting);
        assert_eq!(changes.try_recv().unwrap().current, ConnectionState::Failed);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_connect_schedules_unattended_retry() {
        let backend = PooledBackend::new(test_config());

        assert!(backend.connect().await.is_err());

        assert_eq!(backend.state(), ConnectionState::Failed);
        assert!(backend.inner.retry_scheduled.load(Ordering::Relaxed));
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribe_remembers_channel_despite_connect_failure() {
        let backend = PooledBackend::new(test_config());

        assert!(backend.subscribe_channel("tournament-42").await.is_err());

        // The intent is recorded and replayed once a connect succeeds
        assert!(backend.inner.subscribed.contains("tournament-42"));
        assert!(backend.inner.router.room_exists("tournament-42"));
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_message_fans_out_through_router() {
        let backend = PooledBackend::new(test_config());
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits_inner = Arc::clone(&hits);
        let guard = backend.router().subscribe(
            "tournament-42",
            &[crate::rooms::WILDCARD],
            Arc::new(move |_| {
                hits_inner.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        let frame = WireMessage::message("tournament-42", "score-update", json!({"points": 3}));
        backend.inner.handle_inbound(frame.clone());
        // Redelivery within the dedup window is suppressed
        backend.inner.handle_inbound(frame);

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        guard.unsubscribe();
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_connected_ack_seeds_presence_roster() {
        let backend = PooledBackend::new(test_config());

        backend.inner.handle_inbound(WireMessage::Connected {
            channel: Some("presence-court-1".to_string()),
            data: Some(json!({
                "members": [
                    {"id": "alice", "joined_at": 1},
                    {"id": "bob", "joined_at": 2}
                ]
            })),
        });

        assert_eq!(backend.router().members("presence-court-1").len(), 2);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_shape() {
        let backend = PooledBackend::new(test_config());
        backend
            .trigger("tournament-42", "score-update", json!({}), Priority::Normal)
            .unwrap();

        let metrics = backend.metrics();
        assert_eq!(metrics["backend"], "pooled");
        assert_eq!(metrics["connected"], false);
        assert_eq!(metrics["queue"]["len"], 1);
        backend.shutdown().await;
    }
}
