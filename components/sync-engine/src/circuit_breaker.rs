//! Circuit breaker (section 5), keyed by `workspace:providerId` and shared by the
//! outbox, subscription manager and gc loop so a failing provider stops
//! all three rather than each hammering it independently.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const FAILURE_THRESHOLD: u32 = 5;
const OPEN_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct KeyState {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// A registry of per-key breakers. Cheap to clone (an `Arc` around the
/// shared map would also work; this crate keeps it a plain struct and
/// expects callers to hold one behind their own `Arc`, matching how the
/// rest of the engine shares state).
#[derive(Default)]
pub struct CircuitBreaker {
    keys: Mutex<HashMap<String, KeyState>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while calls for `key` should be skipped. Transitions
    /// `Open -> HalfOpen` once the cooldown elapses, allowing exactly the
    /// next caller's probe through (reflected by this returning `false`
    /// once, until a failure reopens it).
    pub fn is_open(&self, key: &str) -> bool {
        let mut keys = self.keys.lock();
        let entry = keys.entry(key.to_string()).or_default();
        match entry.state {
            State::Closed => false,
            State::HalfOpen => false,
            State::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= OPEN_COOLDOWN {
                    entry.state = State::HalfOpen;
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut keys = self.keys.lock();
        let entry = keys.entry(key.to_string()).or_default();
        entry.state = State::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
    }

    pub fn record_failure(&self, key: &str) {
        let mut keys = self.keys.lock();
        let entry = keys.entry(key.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.state == State::HalfOpen || entry.consecutive_failures >= FAILURE_THRESHOLD {
            entry.state = State::Open;
            entry.opened_at = Some(Instant::now());
        }
    }
}
