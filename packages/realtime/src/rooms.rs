//! Room registry and pub/sub fan-out
//!
//! A room is a logical topic with membership and subscriptions. The router
//! owns rooms and their fan-out only; the channel-to-connection routing
//! table lives in the pool. Broadcasts run synchronously in subscription
//! registration order, with each callback isolated so one panicking handler
//! cannot block delivery to its siblings.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Channel capacity for router monitoring events
const EVENT_CAPACITY: usize = 256;

/// Wildcard event name matching every event in a room
pub const WILDCARD: &str = "*";

/// Room classification, derived heuristically from the channel name
///
/// Metadata only; membership authorization is delegated to the auth token
/// the transport was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Tournament,
    Match,
    Global,
    Private,
    Presence,
}

/// Classify a channel name into a room type
pub fn classify_channel(channel: &str) -> RoomType {
    if channel.starts_with("presence-") {
        RoomType::Presence
    } else if channel.starts_with("private-") {
        RoomType::Private
    } else if channel.contains("tournament") {
        RoomType::Tournament
    } else if channel.contains("match") {
        RoomType::Match
    } else {
        RoomType::Global
    }
}

/// A member tracked in a room's roster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMember {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    pub joined_at: i64,
}

/// One logical topic with membership and metadata
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub room_type: RoomType,
    pub members: HashMap<String, PresenceMember>,
    pub metadata: Value,
    pub created_at: i64,
    pub last_activity: i64,
}

/// The event record handed to subscription callbacks
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub room_id: String,
    pub event: String,
    pub data: Value,
    pub timestamp: i64,
    /// Originating member, when the broadcast excluded one
    pub sender: Option<String>,
}

/// Monitoring-only events emitted by the router
#[derive(Debug, Clone)]
pub enum RouterEvent {
    RoomCreated { room_id: String, room_type: RoomType },
    RoomRemoved { room_id: String },
    MemberJoined { room_id: String, member_id: String },
    MemberLeft { room_id: String, member_id: String },
    Broadcast { room_id: String, event: String, delivered: usize },
}

/// Subscription callback invoked synchronously during broadcast
pub type RoomCallback = Arc<dyn Fn(&RoomEvent) + Send + Sync>;

/// Per-room delivery predicate; returning false vetoes the broadcast
pub type RoomFilter = Arc<dyn Fn(&RoomEvent) -> bool + Send + Sync>;

struct Subscription {
    id: u64,
    /// Member this subscription belongs to; `None` for channel-level binds
    member_id: Option<String>,
    events: HashSet<String>,
    callback: RoomCallback,
}

impl Subscription {
    fn matches(&self, event: &str) -> bool {
        self.events.contains(WILDCARD) || self.events.contains(event)
    }
}

type SubscriptionMap = Arc<Mutex<HashMap<String, Vec<Subscription>>>>;

/// Idempotent unsubscribe handle, safe to call after the room is gone
#[must_use = "dropping the guard without calling unsubscribe leaks the subscription"]
pub struct SubscriptionGuard {
    subscriptions: SubscriptionMap,
    room_id: String,
    id: u64,
    active: AtomicBool,
}

impl SubscriptionGuard {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let mut subs = self.subscriptions.lock().expect("router lock poisoned");
            if let Some(list) = subs.get_mut(&self.room_id) {
                list.retain(|s| s.id != self.id);
                if list.is_empty() {
                    subs.remove(&self.room_id);
                }
            }
        }
    }
}

/// Maps logical topics to subscriber callbacks; tracks presence rosters
pub struct RoomRouter {
    rooms: Mutex<HashMap<String, Room>>,
    subscriptions: SubscriptionMap,
    filters: Mutex<HashMap<String, RoomFilter>>,
    next_subscription: AtomicU64,
    events: broadcast::Sender<RouterEvent>,
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRouter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            rooms: Mutex::new(HashMap::new()),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            filters: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
            events,
        }
    }

    /// Monitoring stream of router events
    pub fn events(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// Create a room; idempotent, returns false when it already existed
    pub fn create_room(
        &self,
        id: &str,
        name: &str,
        room_type: RoomType,
        metadata: Value,
    ) -> bool {
        let created = {
            let mut rooms = self.rooms.lock().expect("router lock poisoned");
            if rooms.contains_key(id) {
                false
            } else {
                let now = chrono::Utc::now().timestamp_millis();
                rooms.insert(
                    id.to_string(),
                    Room {
                        id: id.to_string(),
                        name: name.to_string(),
                        room_type,
                        members: HashMap::new(),
                        metadata,
                        created_at: now,
                        last_activity: now,
                    },
                );
                true
            }
        };
        if created {
            tracing::debug!(room_id = %id, room_type = ?room_type, "room created");
            let _ = self.events.send(RouterEvent::RoomCreated {
                room_id: id.to_string(),
                room_type,
            });
        }
        created
    }

    /// Ensure a room exists for a raw channel name, classifying its type
    pub fn ensure_room_for_channel(&self, channel: &str) {
        self.create_room(channel, channel, classify_channel(channel), Value::Null);
    }

    pub fn room_exists(&self, id: &str) -> bool {
        self.rooms
            .lock()
            .expect("router lock poisoned")
            .contains_key(id)
    }

    pub fn list_rooms(&self) -> Vec<String> {
        self.rooms
            .lock()
            .expect("router lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn room(&self, id: &str) -> Option<Room> {
        self.rooms
            .lock()
            .expect("router lock poisoned")
            .get(id)
            .cloned()
    }

    /// Current roster of a room
    pub fn members(&self, room_id: &str) -> Vec<PresenceMember> {
        self.rooms
            .lock()
            .expect("router lock poisoned")
            .get(room_id)
            .map(|r| r.members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Add a member to a room; no-ops (returns false) when the room is
    /// missing. Broadcasts `member:joined` to everyone but the joiner.
    pub fn join_room(&self, room_id: &str, member_id: &str, info: Option<Value>) -> bool {
        let member = {
            let mut rooms = self.rooms.lock().expect("router lock poisoned");
            let Some(room) = rooms.get_mut(room_id) else {
                return false;
            };
            let member = PresenceMember {
                id: member_id.to_string(),
                info,
                joined_at: chrono::Utc::now().timestamp_millis(),
            };
            room.members.insert(member_id.to_string(), member.clone());
            room.last_activity = member.joined_at;
            member
        };

        let _ = self.events.send(RouterEvent::MemberJoined {
            room_id: room_id.to_string(),
            member_id: member_id.to_string(),
        });
        self.broadcast_to_room(
            room_id,
            "member:joined",
            serde_json::to_value(&member).unwrap_or(Value::Null),
            Some(member_id),
        );
        true
    }

    /// Remove a member; deletes empty non-global rooms
    pub fn leave_room(&self, room_id: &str, member_id: &str) -> bool {
        let removed_room = {
            let mut rooms = self.rooms.lock().expect("router lock poisoned");
            let Some(room) = rooms.get_mut(room_id) else {
                return false;
            };
            if room.members.remove(member_id).is_none() {
                return false;
            }
            room.last_activity = chrono::Utc::now().timestamp_millis();
            room.members.is_empty() && room.room_type != RoomType::Global
        };

        let _ = self.events.send(RouterEvent::MemberLeft {
            room_id: room_id.to_string(),
            member_id: member_id.to_string(),
        });
        self.broadcast_to_room(
            room_id,
            "member:left",
            serde_json::json!({ "id": member_id }),
            Some(member_id),
        );

        if removed_room {
            self.remove_room(room_id);
        }
        true
    }

    /// Register a channel-level subscription for the given event names
    /// (which may include the `*` wildcard). Creates the room on first use.
    pub fn subscribe(
        &self,
        room_id: &str,
        events: &[&str],
        callback: RoomCallback,
    ) -> SubscriptionGuard {
        self.subscribe_inner(room_id, None, events, callback)
    }

    /// Register a subscription owned by a member, eligible for
    /// member-targeted delivery and broadcast exclusion
    pub fn subscribe_as(
        &self,
        room_id: &str,
        member_id: &str,
        events: &[&str],
        callback: RoomCallback,
    ) -> SubscriptionGuard {
        self.subscribe_inner(room_id, Some(member_id.to_string()), events, callback)
    }

    fn subscribe_inner(
        &self,
        room_id: &str,
        member_id: Option<String>,
        events: &[&str],
        callback: RoomCallback,
    ) -> SubscriptionGuard {
        self.ensure_room_for_channel(room_id);
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let subscription = Subscription {
            id,
            member_id,
            events: events.iter().map(|e| e.to_string()).collect(),
            callback,
        };
        self.subscriptions
            .lock()
            .expect("router lock poisoned")
            .entry(room_id.to_string())
            .or_default()
            .push(subscription);

        SubscriptionGuard {
            subscriptions: Arc::clone(&self.subscriptions),
            room_id: room_id.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Install a per-room delivery predicate; returning false vetoes
    pub fn set_room_filter(&self, room_id: &str, filter: RoomFilter) {
        self.filters
            .lock()
            .expect("router lock poisoned")
            .insert(room_id.to_string(), filter);
    }

    pub fn clear_room_filter(&self, room_id: &str) {
        self.filters
            .lock()
            .expect("router lock poisoned")
            .remove(room_id);
    }

    /// Deliver an event to every matching subscription in registration
    /// order, excluding the optional originating member. Returns the number
    /// of callbacks invoked.
    pub fn broadcast_to_room(
        &self,
        room_id: &str,
        event: &str,
        data: Value,
        exclude_member: Option<&str>,
    ) -> usize {
        self.deliver(room_id, event, data, exclude_member, None)
    }

    /// Deliver an event only to subscriptions owned by the given members
    pub fn send_to_members(
        &self,
        room_id: &str,
        member_ids: &[&str],
        event: &str,
        data: Value,
    ) -> usize {
        self.deliver(room_id, event, data, None, Some(member_ids))
    }

    fn deliver(
        &self,
        room_id: &str,
        event: &str,
        data: Value,
        exclude_member: Option<&str>,
        only_members: Option<&[&str]>,
    ) -> usize {
        let record = RoomEvent {
            room_id: room_id.to_string(),
            event: event.to_string(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            sender: exclude_member.map(String::from),
        };

        {
            let mut rooms = self.rooms.lock().expect("router lock poisoned");
            match rooms.get_mut(room_id) {
                Some(room) => room.last_activity = record.timestamp,
                None => return 0,
            }
        }

        let vetoed = {
            let filters = self.filters.lock().expect("router lock poisoned");
            filters.get(room_id).map(|f| !f(&record)).unwrap_or(false)
        };
        if vetoed {
            tracing::trace!(room_id = %room_id, event = %event, "broadcast vetoed by room filter");
            return 0;
        }

        // Snapshot matching callbacks in registration order, then invoke
        // outside the lock so a handler may subscribe or unsubscribe freely
        let callbacks: Vec<RoomCallback> = {
            let subs = self.subscriptions.lock().expect("router lock poisoned");
            subs.get(room_id)
                .map(|list| {
                    list.iter()
                        .filter(|s| s.matches(event))
                        .filter(|s| match (exclude_member, &s.member_id) {
                            (Some(excluded), Some(owner)) => owner != excluded,
                            _ => true,
                        })
                        .filter(|s| match only_members {
                            Some(targets) => s
                                .member_id
                                .as_deref()
                                .map(|owner| targets.contains(&owner))
                                .unwrap_or(false),
                            None => true,
                        })
                        .map(|s| Arc::clone(&s.callback))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&record))).is_err() {
                tracing::error!(
                    room_id = %room_id,
                    event = %event,
                    "subscriber callback panicked during broadcast"
                );
            } else {
                delivered += 1;
            }
        }

        let _ = self.events.send(RouterEvent::Broadcast {
            room_id: room_id.to_string(),
            event: event.to_string(),
            delivered,
        });
        delivered
    }

    /// Remove a member from the roster without broadcasting; inbound
    /// presence frames carry their own fan-out and must not echo
    pub fn drop_member(&self, room_id: &str, member_id: &str) -> bool {
        let mut rooms = self.rooms.lock().expect("router lock poisoned");
        rooms
            .get_mut(room_id)
            .map(|room| room.members.remove(member_id).is_some())
            .unwrap_or(false)
    }

    /// Re-seed a room roster from server-provided presence data
    pub fn seed_members(&self, room_id: &str, members: Vec<PresenceMember>) {
        let mut rooms = self.rooms.lock().expect("router lock poisoned");
        if let Some(room) = rooms.get_mut(room_id) {
            for member in members {
                room.members.insert(member.id.clone(), member);
            }
        }
    }

    /// Sweep empty, non-global rooms idle past the threshold
    pub fn cleanup_inactive_rooms(&self, max_inactive: Duration) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_inactive.as_millis() as i64;
        let stale: Vec<String> = {
            let rooms = self.rooms.lock().expect("router lock poisoned");
            rooms
                .values()
                .filter(|r| {
                    r.members.is_empty()
                        && r.room_type != RoomType::Global
                        && r.last_activity < cutoff
                })
                .map(|r| r.id.clone())
                .collect()
        };
        for room_id in &stale {
            self.remove_room(room_id);
        }
        stale.len()
    }

    fn remove_room(&self, room_id: &str) {
        let removed = self
            .rooms
            .lock()
            .expect("router lock poisoned")
            .remove(room_id)
            .is_some();
        if removed {
            self.filters
                .lock()
                .expect("router lock poisoned")
                .remove(room_id);
            tracing::debug!(room_id = %room_id, "room removed");
            let _ = self.events.send(RouterEvent::RoomRemoved {
                room_id: room_id.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback() -> (RoomCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let callback: RoomCallback = Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn test_classify_channel() {
        assert_eq!(classify_channel("presence-lobby"), RoomType::Presence);
        assert_eq!(classify_channel("private-admin"), RoomType::Private);
        assert_eq!(classify_channel("tournament-42"), RoomType::Tournament);
        assert_eq!(classify_channel("match-m1"), RoomType::Match);
        assert_eq!(classify_channel("announcements"), RoomType::Global);
    }

    #[test]
    fn test_create_room_is_idempotent() {
        let router = RoomRouter::new();
        assert!(router.create_room("tournament-42", "Main", RoomType::Tournament, Value::Null));
        assert!(!router.create_room("tournament-42", "Main", RoomType::Tournament, Value::Null));
        assert_eq!(router.list_rooms().len(), 1);
    }

    #[test]
    fn test_join_missing_room_is_a_noop() {
        let router = RoomRouter::new();
        assert!(!router.join_room("nowhere", "alice", None));
    }

    #[test]
    fn test_join_then_leave_removes_empty_non_global_room() {
        let router = RoomRouter::new();
        router.create_room("match-m1", "Match 1", RoomType::Match, Value::Null);

        assert!(router.join_room("match-m1", "alice", None));
        assert!(router.leave_room("match-m1", "alice"));
        assert!(!router.room_exists("match-m1"));
        assert!(router.list_rooms().is_empty());
    }

    #[test]
    fn test_global_room_survives_emptying() {
        let router = RoomRouter::new();
        router.create_room("announcements", "All", RoomType::Global, Value::Null);

        router.join_room("announcements", "alice", None);
        router.leave_room("announcements", "alice");
        assert!(router.room_exists("announcements"));
    }

    #[test]
    fn test_broadcast_matches_exact_and_wildcard() {
        let router = RoomRouter::new();
        let (exact_cb, exact) = counter_callback();
        let (wild_cb, wild) = counter_callback();
        let (other_cb, other) = counter_callback();

        let g1 = router.subscribe("tournament-42", &["score-update"], exact_cb);
        let g2 = router.subscribe("tournament-42", &[WILDCARD], wild_cb);
        let g3 = router.subscribe("tournament-42", &["leaderboard"], other_cb);

        let delivered =
            router.broadcast_to_room("tournament-42", "score-update", json!({"points": 3}), None);

        assert_eq!(delivered, 2);
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wild.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);

        g1.unsubscribe();
        g2.unsubscribe();
        g3.unsubscribe();
    }

    #[test]
    fn test_broadcast_order_is_registration_order() {
        let router = RoomRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut guards = Vec::new();
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            guards.push(router.subscribe(
                "tournament-42",
                &[WILDCARD],
                Arc::new(move |_| order.lock().unwrap().push(tag)),
            ));
        }

        router.broadcast_to_room("tournament-42", "score-update", Value::Null, None);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
        for g in guards {
            g.unsubscribe();
        }
    }

    #[test]
    fn test_panicking_callback_does_not_block_siblings() {
        let router = RoomRouter::new();
        let (ok_cb, ok) = counter_callback();

        let g1 = router.subscribe(
            "tournament-42",
            &[WILDCARD],
            Arc::new(|_| panic!("faulty handler")),
        );
        let g2 = router.subscribe("tournament-42", &[WILDCARD], ok_cb);

        let delivered =
            router.broadcast_to_room("tournament-42", "score-update", Value::Null, None);

        assert_eq!(delivered, 1);
        assert_eq!(ok.load(Ordering::SeqCst), 1);
        g1.unsubscribe();
        g2.unsubscribe();
    }

    #[test]
    fn test_broadcast_excludes_originating_member() {
        let router = RoomRouter::new();
        router.create_room("match-m1", "Match 1", RoomType::Match, Value::Null);
        let (alice_cb, alice) = counter_callback();
        let (bob_cb, bob) = counter_callback();

        let g1 = router.subscribe_as("match-m1", "alice", &[WILDCARD], alice_cb);
        let g2 = router.subscribe_as("match-m1", "bob", &[WILDCARD], bob_cb);

        router.broadcast_to_room("match-m1", "score-update", Value::Null, Some("alice"));

        assert_eq!(alice.load(Ordering::SeqCst), 0);
        assert_eq!(bob.load(Ordering::SeqCst), 1);
        g1.unsubscribe();
        g2.unsubscribe();
    }

    #[test]
    fn test_send_to_members_targets_subset() {
        let router = RoomRouter::new();
        let (alice_cb, alice) = counter_callback();
        let (bob_cb, bob) = counter_callback();
        let (monitor_cb, monitor) = counter_callback();

        let g1 = router.subscribe_as("match-m1", "alice", &[WILDCARD], alice_cb);
        let g2 = router.subscribe_as("match-m1", "bob", &[WILDCARD], bob_cb);
        let g3 = router.subscribe("match-m1", &[WILDCARD], monitor_cb);

        let delivered =
            router.send_to_members("match-m1", &["alice"], "up-next", json!({"court": 2}));

        assert_eq!(delivered, 1);
        assert_eq!(alice.load(Ordering::SeqCst), 1);
        assert_eq!(bob.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.load(Ordering::SeqCst), 0);
        g1.unsubscribe();
        g2.unsubscribe();
        g3.unsubscribe();
    }

    #[test]
    fn test_room_filter_vetoes_delivery() {
        let router = RoomRouter::new();
        let (cb, count) = counter_callback();
        let guard = router.subscribe("tournament-42", &[WILDCARD], cb);

        router.set_room_filter(
            "tournament-42",
            Arc::new(|event| event.event != "spoiler"),
        );

        assert_eq!(
            router.broadcast_to_room("tournament-42", "spoiler", Value::Null, None),
            0
        );
        assert_eq!(
            router.broadcast_to_room("tournament-42", "score-update", Value::Null, None),
            1
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
        guard.unsubscribe();
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_survives_room_teardown() {
        let router = RoomRouter::new();
        let (cb, count) = counter_callback();
        let guard = router.subscribe("match-m1", &[WILDCARD], cb);

        router.join_room("match-m1", "alice", None);
        router.leave_room("match-m1", "alice"); // removes the room

        guard.unsubscribe();
        guard.unsubscribe();

        router.create_room("match-m1", "Match 1", RoomType::Match, Value::Null);
        router.broadcast_to_room("match-m1", "score-update", Value::Null, None);
        // member:joined and member:left reached the wildcard subscription;
        // nothing after the unsubscribe did
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cleanup_sweeps_stale_empty_rooms() {
        let router = RoomRouter::new();
        router.create_room("match-m1", "Match 1", RoomType::Match, Value::Null);
        router.create_room("announcements", "All", RoomType::Global, Value::Null);
        {
            let mut rooms = router.rooms.lock().unwrap();
            for room in rooms.values_mut() {
                room.last_activity -= 10_000;
            }
        }

        let swept = router.cleanup_inactive_rooms(Duration::from_secs(5));

        assert_eq!(swept, 1);
        assert!(!router.room_exists("match-m1"));
        assert!(router.room_exists("announcements"));
    }

    #[test]
    fn test_presence_roster_tracks_membership() {
        let router = RoomRouter::new();
        router.create_room("presence-court-1", "Court 1", RoomType::Presence, Value::Null);

        router.join_room("presence-court-1", "alice", Some(json!({"name": "Alice"})));
        router.join_room("presence-court-1", "bob", None);
        assert_eq!(router.members("presence-court-1").len(), 2);

        router.leave_room("presence-court-1", "alice");
        let members = router.members("presence-court-1");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, "bob");
    }
}
