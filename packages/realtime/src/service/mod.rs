//! Realtime transport service facade
//!
//! [`RealtimeService`] is the single entry point consumers hold. It wraps
//! one of three backends behind a closed enum: the pooled raw-socket
//! backend, the hosted provider adapter, or a no-op stand-in. The contract
//! is uniform across backends, so callers never branch on which transport
//! (if any) is actually available.

pub mod hosted;
pub mod noop;
pub mod pooled;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::RealtimeConfig;
use crate::dedup::Deduplicator;
use crate::error::{RealtimeError, RealtimeResult};
use crate::queue::Priority;
use crate::rooms::{PresenceMember, RoomEvent, RoomRouter, SubscriptionGuard, WILDCARD};

/// Channel capacity for state-change broadcasts
const STATE_CAPACITY: usize = 256;

/// Shared presence channel the hosted backend pings for latency sampling
pub const GLOBAL_CHANNEL: &str = "courtside-global";

/// Facade-level connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// One state transition, emitted on every change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

/// Tracks the facade state machine and broadcasts transitions
pub(crate) struct StateTracker {
    state: Mutex<ConnectionState>,
    changes: broadcast::Sender<StateChange>,
}

impl StateTracker {
    pub(crate) fn new() -> Self {
        let (changes, _) = broadcast::channel(STATE_CAPACITY);
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            changes,
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Move to a new state, emitting the transition; same-state moves are
    /// silent no-ops
    pub(crate) fn transition(&self, to: ConnectionState) {
        let previous = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let previous = *state;
            if previous == to {
                return;
            }
            *state = to;
            previous
        };
        tracing::debug!(from = ?previous, to = ?to, "connection state changed");
        let _ = self.changes.send(StateChange {
            previous,
            current: to,
        });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

/// Route one inbound application event: dedup, roster upkeep, then room
/// fan-out. Returns the number of callbacks invoked.
pub(crate) fn dispatch_inbound(
    router: &RoomRouter,
    dedup: &Deduplicator,
    channel: &str,
    event: &str,
    data: Value,
) -> usize {
    if dedup.is_duplicate(channel, event, &data) {
        tracing::trace!(channel = %channel, event = %event, "suppressing duplicate delivery");
        return 0;
    }
    router.ensure_room_for_channel(channel);
    match event {
        "member:joined" => {
            if let Ok(member) = serde_json::from_value::<PresenceMember>(data.clone()) {
                router.seed_members(channel, vec![member]);
            }
        }
        "member:left" => {
            if let Some(id) = data.get("id").and_then(Value::as_str) {
                router.drop_member(channel, id);
            }
        }
        _ => {}
    }
    router.broadcast_to_room(channel, event, data, None)
}

/// Unified realtime transport service
#[derive(Clone)]
pub struct RealtimeService {
    inner: Arc<ServiceInner>,
}

enum ServiceInner {
    /// Pooled raw-socket backend over self-hosted endpoints
    Pooled(pooled::PooledBackend),
    /// Hosted pub/sub provider adapter
    Hosted(hosted::HostedBackend),
    /// No transport; full contract, no I/O
    Noop(noop::NoopBackend),
}

impl RealtimeService {
    /// Build the service from resolved configuration
    ///
    /// Backend selection happens exactly once: disabled yields no-op, a
    /// pooled config wins over hosted, and an empty config degrades to
    /// no-op so callers never branch on availability.
    pub fn from_config(config: RealtimeConfig) -> Self {
        if !config.enabled {
            tracing::info!("realtime disabled, using no-op backend");
            return Self::noop();
        }
        if let Some(pooled) = config.pooled {
            tracing::info!(endpoints = pooled.endpoints.len(), "using pooled realtime backend");
            return Self {
                inner: Arc::new(ServiceInner::Pooled(pooled::PooledBackend::new(pooled))),
            };
        }
        if let Some(hosted) = config.hosted {
            tracing::info!(cluster = %hosted.cluster, "using hosted realtime backend");
            return Self {
                inner: Arc::new(ServiceInner::Hosted(hosted::HostedBackend::new(hosted))),
            };
        }
        tracing::warn!("realtime enabled but no backend configured, using no-op backend");
        Self::noop()
    }

    /// Build the service from environment configuration
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::from_config(RealtimeConfig::from_env()?))
    }

    /// A service with no transport at all
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(ServiceInner::Noop(noop::NoopBackend::new())),
        }
    }

    /// The room router shared with policy layers such as
    /// [`crate::tournament::TournamentRoomManager`]
    pub fn room_router(&self) -> Arc<RoomRouter> {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.router(),
            ServiceInner::Hosted(backend) => backend.router(),
            ServiceInner::Noop(backend) => backend.router(),
        }
    }

    /// Open the transport
    pub async fn connect(&self) -> RealtimeResult<()> {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.connect().await,
            ServiceInner::Hosted(backend) => backend.connect().await,
            ServiceInner::Noop(backend) => backend.connect(),
        }
    }

    /// Close the transport; queued messages are retained
    pub async fn disconnect(&self) {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.disconnect().await,
            ServiceInner::Hosted(backend) => backend.disconnect().await,
            ServiceInner::Noop(backend) => backend.disconnect(),
        }
    }

    /// Tear down and re-open the transport
    pub async fn reconnect(&self) -> RealtimeResult<()> {
        self.disconnect().await;
        self.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.state(),
            ServiceInner::Hosted(backend) => backend.state(),
            ServiceInner::Noop(backend) => backend.state(),
        }
    }

    /// Broadcast receiver of connection state transitions
    pub fn on_state_change(&self) -> broadcast::Receiver<StateChange> {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.on_state_change(),
            ServiceInner::Hosted(backend) => backend.on_state_change(),
            ServiceInner::Noop(backend) => backend.on_state_change(),
        }
    }

    /// Subscribe to a channel, returning a handle for binding callbacks and
    /// triggering events on it
    pub async fn subscribe(&self, channel: &str) -> RealtimeResult<ChannelHandle> {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.subscribe_channel(channel).await?,
            ServiceInner::Hosted(backend) => backend.subscribe_channel(channel).await?,
            ServiceInner::Noop(backend) => backend.subscribe_channel(channel),
        }
        Ok(ChannelHandle {
            channel: channel.to_string(),
            router: self.room_router(),
            service: self.clone(),
        })
    }

    pub async fn unsubscribe(&self, channel: &str) {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.unsubscribe_channel(channel).await,
            ServiceInner::Hosted(backend) => backend.unsubscribe_channel(channel).await,
            ServiceInner::Noop(backend) => backend.unsubscribe_channel(channel),
        }
    }

    /// Publish an event to a channel at normal priority
    pub async fn trigger(&self, channel: &str, event: &str, data: Value) -> RealtimeResult<()> {
        self.trigger_with_priority(channel, event, data, Priority::Normal)
            .await
    }

    /// Publish an event to a channel with an explicit queue priority
    ///
    /// Priority matters only on the pooled backend, which buffers outbound
    /// traffic; the others send (or drop) immediately.
    pub async fn trigger_with_priority(
        &self,
        channel: &str,
        event: &str,
        data: Value,
        priority: Priority,
    ) -> RealtimeResult<()> {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.trigger(channel, event, data, priority),
            ServiceInner::Hosted(backend) => backend.trigger(channel, event, data).await,
            ServiceInner::Noop(backend) => backend.trigger(channel, event, data),
        }
    }

    /// Subscribe to a `presence-` channel, returning a roster-aware handle
    pub async fn subscribe_presence(&self, channel: &str) -> RealtimeResult<PresenceChannel> {
        if !channel.starts_with("presence-") {
            return Err(RealtimeError::PresenceUnsupported(channel.to_string()));
        }
        let handle = self.subscribe(channel).await?;
        Ok(PresenceChannel { handle })
    }

    /// Backend-specific metrics as a JSON document
    pub fn metrics(&self) -> Value {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.metrics(),
            ServiceInner::Hosted(backend) => backend.metrics(),
            ServiceInner::Noop(backend) => backend.metrics(),
        }
    }

    /// Mean transport round-trip latency, when samples exist
    pub fn latency(&self) -> Option<f64> {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.latency(),
            ServiceInner::Hosted(backend) => backend.latency(),
            ServiceInner::Noop(_) => None,
        }
    }

    /// Close the transport, stop timers, and detach listeners; the service
    /// accepts no further traffic afterwards
    pub async fn shutdown(&self) {
        match &*self.inner {
            ServiceInner::Pooled(backend) => backend.shutdown().await,
            ServiceInner::Hosted(backend) => backend.shutdown().await,
            ServiceInner::Noop(backend) => backend.shutdown(),
        }
    }
}

/// A subscribed channel: bind callbacks, trigger events
pub struct ChannelHandle {
    channel: String,
    router: Arc<RoomRouter>,
    service: RealtimeService,
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.channel
    }

    /// Bind a callback to one event on this channel
    pub fn bind(
        &self,
        event: &str,
        callback: impl Fn(&RoomEvent) + Send + Sync + 'static,
    ) -> SubscriptionGuard {
        self.router
            .subscribe(&self.channel, &[event], Arc::new(callback))
    }

    /// Bind a callback to every event on this channel
    pub fn bind_all(
        &self,
        callback: impl Fn(&RoomEvent) + Send + Sync + 'static,
    ) -> SubscriptionGuard {
        self.router
            .subscribe(&self.channel, &[WILDCARD], Arc::new(callback))
    }

    /// Publish an event on this channel
    pub async fn trigger(&self, event: &str, data: Value) -> RealtimeResult<()> {
        self.service.trigger(&self.channel, event, data).await
    }
}

/// A subscribed `presence-` channel with a member roster
pub struct PresenceChannel {
    handle: ChannelHandle,
}

impl PresenceChannel {
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// The channel handle, for event-level binds and triggers
    pub fn channel(&self) -> &ChannelHandle {
        &self.handle
    }

    /// Current member roster
    pub fn members(&self) -> Vec<PresenceMember> {
        self.handle.router.members(&self.handle.channel)
    }

    /// Bind a callback run when a member joins
    pub fn on_member_added(
        &self,
        callback: impl Fn(&PresenceMember) + Send + Sync + 'static,
    ) -> SubscriptionGuard {
        self.handle.bind("member:joined", move |event| {
            match serde_json::from_value::<PresenceMember>(event.data.clone()) {
                Ok(member) => callback(&member),
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring malformed member:joined payload");
                }
            }
        })
    }

    /// Bind a callback run with the member id when a member leaves
    pub fn on_member_removed(
        &self,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> SubscriptionGuard {
        self.handle.bind("member:left", move |event| {
            if let Some(id) = event.data.get("id").and_then(Value::as_str) {
                callback(id);
            }
        })
    }
}
