//! Recent-op cache (section 4.2): echo suppression. After pushing op X, the
//! server will hand X back through pull/subscribe; the resolver must drop
//! that echo rather than recompute a conflict against itself.
//!
//! Bounded LRU keyed by op id with a per-entry deadline, as the design
//! notes call for: a hash map for O(1) lookup plus an insertion-ordered
//! queue for O(1) amortized oldest-first eviction once capacity is hit.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const TTL: Duration = Duration::from_secs(60);
const CAPACITY: usize = 2000;

struct Inner {
    deadlines: HashMap<String, Instant>,
    order: VecDeque<String>,
}

pub struct RecentOpCache {
    inner: Mutex<Inner>,
}

impl Default for RecentOpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RecentOpCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                deadlines: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Record `op_id` as recently pushed. No-op for null/empty ids.
    pub fn mark(&self, op_id: &str) {
        if op_id.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.deadlines.insert(op_id.to_string(), now + TTL).is_none() {
            inner.order.push_back(op_id.to_string());
        }
        while inner.order.len() > CAPACITY {
            if let Some(oldest) = inner.order.pop_front() {
                // Only drop the map entry if it's still the one we just
                // evicted from the order queue (mark() of an existing id
                // doesn't reinsert into `order`, so this is always true
                // here, but a fresher `mark()` could have raced it).
                inner.deadlines.remove(&oldest);
            }
        }
    }

    /// True if `op_id` was marked within the last TTL seconds.
    pub fn is_recent(&self, op_id: &str) -> bool {
        if op_id.is_empty() {
            return false;
        }
        let inner = self.inner.lock();
        match inner.deadlines.get(op_id) {
            Some(deadline) => *deadline > Instant::now(),
            None => false,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().deadlines.len()
    }
}
