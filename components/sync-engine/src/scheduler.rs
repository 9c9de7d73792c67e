//! A small registry of the engine's background loops (outbox flush,
//! subscription, gc), so `dispose()` has one place to stop everything
//! rather than the host needing to track every handle returned by
//! `OutboxManager::start`/`GcManager::start`/`SubscriptionManager::subscribe`
//! individually.

use interrupt_support::Interruptable;
use parking_lot::Mutex;

#[derive(Default)]
pub struct Scheduler {
    handles: Mutex<Vec<Box<dyn Interruptable>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, handle: Box<dyn Interruptable>) {
        self.handles.lock().push(handle);
    }

    /// Interrupts every tracked loop. Idempotent - safe to call from
    /// `dispose()` even if some loops were never started.
    pub fn shutdown(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.interrupt();
        }
    }
}
