//! Observability action hooks (section 7). The engine never decides what a host
//! does with these - toasts, telemetry, logs - it just emits a typed
//! event for every state transition worth reporting and lets an
//! `EventSink` do the rest.

use crate::types::ConflictWinner;

#[derive(Debug, Clone)]
pub enum SubscriptionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone)]
pub enum Event {
    OpCaptured { table: String, pk: String },
    CaptureNonAtomic { table: String, pk: String },
    QueueFull { pending: usize },
    PushBefore { batch_size: usize },
    PushAfter { succeeded: usize, failed: usize },
    Retry { op_id: String, attempts: u32, next_attempt_at: i64 },
    PushError { op_id: String, reason: String },
    ConflictDetected { table: String, pk: String, winner: ConflictWinner },
    SubscriptionStatusChange { status: SubscriptionStatus },
    SubscriptionMaxRetriesExceeded,
    SubscriptionSessionInvalid,
    BootstrapProgress { cursor: u64 },
    BootstrapComplete { elapsed_ms: u64 },
    BootstrapError { reason: String },
    PullReceived { count: usize },
    PullApplied { applied: usize, skipped: usize, conflicts: usize },
    GcError { reason: String },
    GcComplete { tombstones_removed: usize },
}

/// Implemented by hosts that want to react to engine events. The default
/// no-op sink is what every component falls back to when none is wired
/// up, so unit tests don't need to stub one out.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: Event) {}
}

/// Test/debug sink that just remembers every event it saw, in order.
#[derive(Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl RecordingSink {
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
