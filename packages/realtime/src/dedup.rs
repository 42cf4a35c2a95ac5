//! TTL-based suppression of redundant inbound deliveries
//!
//! Providers may redeliver an event after a reconnect or when the same
//! payload arrives over two routes. The deduplicator remembers a fingerprint
//! of each (channel, event, data) triple for a configurable window and
//! reports repeats within that window.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Suppresses identical deliveries seen within the TTL window
#[derive(Debug)]
pub struct Deduplicator {
    ttl: Duration,
    seen: Mutex<HashMap<u64, Instant>>,
}

impl Deduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether this delivery repeats one seen within the TTL
    ///
    /// A miss records the fingerprint, so the first call for a given triple
    /// returns `false` and an identical call within the TTL returns `true`.
    pub fn is_duplicate(&self, channel: &str, event: &str, data: &Value) -> bool {
        let key = fingerprint(channel, event, data);
        let now = Instant::now();

        let mut seen = self.seen.lock().expect("dedup lock poisoned");
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);

        match seen.get(&key) {
            Some(_) => true,
            None => {
                seen.insert(key, now);
                false
            }
        }
    }

    /// Number of fingerprints currently tracked (expired entries included
    /// until the next lookup)
    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all tracked fingerprints
    pub fn clear(&self) {
        self.seen.lock().expect("dedup lock poisoned").clear();
    }
}

fn fingerprint(channel: &str, event: &str, data: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    channel.hash(&mut hasher);
    event.hash(&mut hasher);
    // Value is not Hash; the canonical JSON rendering is stable for a given value
    data.to_string().hash(&mut hasher);
    hasher.finish()
}
