//! Priority-ordered, retryable outbound message buffer
//!
//! Outbound `trigger` calls land here and are drained in batches by the
//! owning backend. Ordering is critical > high > normal > low, oldest first
//! within a class. On overflow the oldest entry of the lowest populated
//! priority class is evicted, so the capacity bound holds even under
//! sustained high-priority load. Messages flagged persistent mirror to a
//! JSON file as a best-effort side channel that never gates the send path.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::QueueConfig;

/// Channel capacity for queue event broadcasts
const EVENT_CAPACITY: usize = 256;

/// Send-order and eviction class for a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// A message awaiting delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub channel: String,
    pub event: String,
    pub data: Value,
    /// Enqueue time (Unix timestamp ms)
    pub timestamp: i64,
    /// Delivery attempts so far
    pub attempts: u32,
    pub priority: Priority,
    /// Optional lifetime; expired messages are dropped at batch time
    pub ttl_ms: Option<i64>,
    /// Mirror this message to the durable store while queued
    pub persistent: bool,
}

impl QueuedMessage {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            event: event.into(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            attempts: 0,
            priority: Priority::Normal,
            ttl_ms: None,
            persistent: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as i64);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.ttl_ms
            .map(|ttl| now_ms - self.timestamp >= ttl)
            .unwrap_or(false)
    }
}

/// Events emitted by the queue
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Periodic signal to bound end-to-end latency; the backend drains the
    /// queue on each flush
    Flush,
    /// A message exhausted its retries (or was displaced on overflow) and
    /// has been dropped; emitted exactly once per message
    Failed {
        message: Box<QueuedMessage>,
        error: String,
    },
}

/// Point-in-time queue occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub len: usize,
    pub low: usize,
    pub normal: usize,
    pub high: usize,
    pub critical: usize,
    /// Enqueue time of the oldest entry still queued
    pub oldest_timestamp: Option<i64>,
}

/// Ordering key: highest priority first, FIFO within a priority
type OrderKey = (Reverse<Priority>, u64, Uuid);

#[derive(Default)]
struct QueueInner {
    entries: HashMap<Uuid, QueuedMessage>,
    order: BTreeSet<OrderKey>,
    seq_of: HashMap<Uuid, u64>,
    next_seq: u64,
}

impl QueueInner {
    fn insert(&mut self, msg: QueuedMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert((Reverse(msg.priority), seq, msg.id));
        self.seq_of.insert(msg.id, seq);
        self.entries.insert(msg.id, msg);
    }

    fn remove(&mut self, id: &Uuid) -> Option<QueuedMessage> {
        let msg = self.entries.remove(id)?;
        if let Some(seq) = self.seq_of.remove(id) {
            self.order.remove(&(Reverse(msg.priority), seq, msg.id));
        }
        Some(msg)
    }

    /// Lowest priority currently present in the queue
    fn lowest_priority(&self) -> Option<Priority> {
        self.order.iter().next_back().map(|(Reverse(p), _, _)| *p)
    }

    /// Oldest entry of the given priority class
    fn oldest_of(&self, priority: Priority) -> Option<Uuid> {
        self.order
            .range((Reverse(priority), 0, Uuid::nil())..)
            .next()
            .filter(|(Reverse(p), _, _)| *p == priority)
            .map(|(_, _, id)| *id)
    }
}

/// Priority message queue with retry accounting and bounded capacity
pub struct MessageQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    events: broadcast::Sender<QueueEvent>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MessageQueue {
    /// Create a queue, reloading any persisted messages from the configured
    /// store and starting the flush timer when a runtime is available
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let queue = Self {
            config,
            inner: Mutex::new(QueueInner::default()),
            events,
            flush_task: Mutex::new(None),
        };

        queue.reload_persisted();
        queue.start_flush_timer();
        queue
    }

    /// Subscribe to queue events (`Flush` ticks and `Failed` drops)
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Insert a message, evicting on overflow per the priority policy
    ///
    /// Returns the message id, or `None` when the queue is full and every
    /// queued entry outranks the incoming message (which is then dropped
    /// with a `Failed` event).
    pub fn enqueue(&self, msg: QueuedMessage) -> Option<Uuid> {
        let id = msg.id;
        let evicted = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");

            let mut evicted = None;
            if inner.entries.len() >= self.config.max_size {
                // A zero-capacity queue has no victim at all; otherwise the
                // newcomer is dropped when everything queued outranks it,
                // keeping the capacity bound without displacing
                // higher-priority traffic
                let victim_class = inner
                    .lowest_priority()
                    .filter(|class| msg.priority >= *class);
                let Some(victim_class) = victim_class else {
                    drop(inner);
                    tracing::debug!(
                        channel = %msg.channel,
                        event = %msg.event,
                        "queue full, dropping message"
                    );
                    let _ = self.events.send(QueueEvent::Failed {
                        message: Box::new(msg),
                        error: "queue full".to_string(),
                    });
                    return None;
                };
                let victim_id = inner.oldest_of(victim_class).expect("populated class");
                evicted = inner.remove(&victim_id);
            }

            inner.insert(msg);
            evicted
        };

        if let Some(victim) = evicted {
            tracing::debug!(
                channel = %victim.channel,
                event = %victim.event,
                priority = ?victim.priority,
                "queue full, evicted oldest lowest-priority message"
            );
            let _ = self.events.send(QueueEvent::Failed {
                message: Box::new(victim),
                error: "evicted on queue overflow".to_string(),
            });
        }

        self.schedule_persist();
        Some(id)
    }

    /// Up to `batch_size` top-priority, oldest-first entries
    ///
    /// TTL-expired entries encountered along the way are dropped silently.
    pub fn next_batch(&self) -> Vec<QueuedMessage> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let mut batch = Vec::new();
        let mut expired = Vec::new();
        for (_, _, id) in inner.order.iter() {
            if batch.len() >= self.config.batch_size {
                break;
            }
            let msg = &inner.entries[id];
            if msg.is_expired(now) {
                expired.push(*id);
            } else {
                batch.push(msg.clone());
            }
        }

        for id in expired {
            inner.remove(&id);
        }
        batch
    }

    /// Acknowledge delivery; acknowledged messages leave the queue
    pub fn mark_sent(&self, ids: &[Uuid]) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            for id in ids {
                inner.remove(id);
            }
        }
        self.schedule_persist();
    }

    /// Record a failed delivery attempt
    ///
    /// Messages below `max_retries` re-enter the back of their priority
    /// class; the rest are dropped with a single `Failed` event each.
    pub fn mark_failed(&self, ids: &[Uuid], error: &str) {
        let mut dropped = Vec::new();
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            for id in ids {
                let Some(mut msg) = inner.remove(id) else {
                    continue;
                };
                msg.attempts += 1;
                if msg.attempts < self.config.max_retries {
                    inner.insert(msg);
                } else {
                    dropped.push(msg);
                }
            }
        }

        for msg in dropped {
            tracing::warn!(
                channel = %msg.channel,
                event = %msg.event,
                attempts = msg.attempts,
                error = %error,
                "message dropped after exhausting retries"
            );
            let _ = self.events.send(QueueEvent::Failed {
                message: Box::new(msg),
                error: error.to_string(),
            });
        }
        self.schedule_persist();
    }

    /// Drive the batch/send/ack cycle against a caller-supplied sender
    ///
    /// The sender's boolean result is pass/fail for the whole batch. A
    /// failed batch ends the cycle after one retry-accounting pass so a
    /// down transport cannot spin here. Returns the number of messages
    /// acknowledged.
    pub async fn process_queue<F, Fut>(&self, send: F) -> usize
    where
        F: Fn(Vec<QueuedMessage>) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let mut sent = 0;
        loop {
            let batch = self.next_batch();
            if batch.is_empty() {
                return sent;
            }
            let ids: Vec<Uuid> = batch.iter().map(|m| m.id).collect();
            if send(batch).await {
                self.mark_sent(&ids);
                sent += ids.len();
            } else {
                self.mark_failed(&ids, "batch send failed");
                return sent;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Occupancy snapshot for dashboards and tests
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut stats = QueueStats {
            len: inner.entries.len(),
            low: 0,
            normal: 0,
            high: 0,
            critical: 0,
            oldest_timestamp: None,
        };
        for msg in inner.entries.values() {
            match msg.priority {
                Priority::Low => stats.low += 1,
                Priority::Normal => stats.normal += 1,
                Priority::High => stats.high += 1,
                Priority::Critical => stats.critical += 1,
            }
            stats.oldest_timestamp = Some(match stats.oldest_timestamp {
                Some(oldest) => oldest.min(msg.timestamp),
                None => msg.timestamp,
            });
        }
        stats
    }

    /// Stop the flush timer; queued messages remain drainable
    pub fn shutdown(&self) {
        if let Some(task) = self.flush_task.lock().expect("queue lock poisoned").take() {
            task.abort();
        }
    }

    fn start_flush_timer(&self) {
        // Unit tests construct queues outside a runtime; they drive flushes
        // explicitly instead
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let events = self.events.clone();
        let interval = self.config.flush_interval;
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if events.send(QueueEvent::Flush).is_err() {
                    // No receivers yet; keep ticking, the backend attaches late
                }
            }
        });
        *self.flush_task.lock().expect("queue lock poisoned") = Some(task);
    }

    fn reload_persisted(&self) {
        let Some(path) = &self.config.persist_path else {
            return;
        };
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read persisted queue");
                return;
            }
        };
        match serde_json::from_slice::<Vec<QueuedMessage>>(&bytes) {
            Ok(messages) => {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                let count = messages.len();
                for msg in messages {
                    inner.insert(msg);
                }
                tracing::info!(count, path = %path.display(), "reloaded persisted queue");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "persisted queue is corrupt, ignoring");
            }
        }
    }

    fn schedule_persist(&self) {
        let Some(path) = self.config.persist_path.clone() else {
            return;
        };
        let snapshot: Vec<QueuedMessage> = {
            let inner = self.inner.lock().expect("queue lock poisoned");
            inner
                .entries
                .values()
                .filter(|m| m.persistent)
                .cloned()
                .collect()
        };
        let Ok(json) = serde_json::to_vec(&snapshot) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = tokio::fs::write(&path, json).await {
                        tracing::debug!(path = %path.display(), error = %e, "queue persist write failed");
                    }
                });
            }
            Err(_) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::debug!(path = %path.display(), error = %e, "queue persist write failed");
                }
            }
        }
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
