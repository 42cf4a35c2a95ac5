//! No-op backend: the full service contract with no transport
//!
//! Used when realtime is disabled or unconfigured. Rooms and subscriptions
//! work locally, triggers are accepted and dropped, and the state never
//! leaves `Disconnected`, so holders of a [`super::RealtimeService`] never
//! need to branch on availability.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::{ConnectionState, StateChange, StateTracker};
use crate::error::RealtimeResult;
use crate::rooms::RoomRouter;

pub struct NoopBackend {
    router: Arc<RoomRouter>,
    state: StateTracker,
}

impl NoopBackend {
    pub fn new() -> Self {
        Self {
            router: Arc::new(RoomRouter::new()),
            state: StateTracker::new(),
        }
    }

    pub fn router(&self) -> Arc<RoomRouter> {
        Arc::clone(&self.router)
    }

    pub fn connect(&self) -> RealtimeResult<()> {
        Ok(())
    }

    pub fn disconnect(&self) {}

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn on_state_change(&self) -> broadcast::Receiver<StateChange> {
        self.state.subscribe()
    }

    pub fn subscribe_channel(&self, channel: &str) {
        self.router.ensure_room_for_channel(channel);
    }

    pub fn unsubscribe_channel(&self, _channel: &str) {}

    /// Accepted and dropped
    pub fn trigger(&self, channel: &str, event: &str, _data: Value) -> RealtimeResult<()> {
        tracing::trace!(channel = %channel, event = %event, "dropping trigger on no-op backend");
        Ok(())
    }

    pub fn metrics(&self) -> Value {
        json!({
            "backend": "noop",
            "connected": false,
            "rooms": self.router.list_rooms().len(),
        })
    }

    pub fn shutdown(&self) {}
}

impl Default for NoopBackend {
    fn default() -> Self {
        Self::new()
    }
}
