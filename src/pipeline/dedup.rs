//! Bounded recent-processed set used to drop transport redeliveries.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::pipeline::types::EventKey;

/// Remembers the last `capacity` event keys. Capacity 0 remembers nothing.
pub struct RecentSet {
    capacity: usize,
    inner: Mutex<Recent>,
}

#[derive(Default)]
struct Recent {
    order: VecDeque<EventKey>,
    seen: HashSet<EventKey>,
}

impl RecentSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Recent::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Record `key`. Returns false if it was already among the recent keys.
    pub fn insert(&self, key: EventKey) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let mut recent = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !recent.seen.insert(key) {
            return false;
        }
        recent.order.push_back(key);
        if recent.order.len() > self.capacity {
            if let Some(evicted) = recent.order.pop_front() {
                recent.seen.remove(&evicted);
            }
        }
        true
    }
}
