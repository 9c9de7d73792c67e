use crate::{Interrupted, Interruptee};
use std::sync::atomic::{AtomicUsize, Ordering};

// Shared counter for InterruptScope:
//   - `interrupt()` increments this.
//   - `was_interrupted()` checks if this changed since the scope was created.
static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Scope for interruptible operations that don't have their own dedicated
/// handle (e.g. a one-off rescan walking pending ops). Multiple components
/// participating in the same logical operation share clones of one scope.
#[derive(Clone, Debug)]
pub struct InterruptScope {
    start_value: usize,
}

impl InterruptScope {
    #[inline]
    pub fn new() -> Self {
        Self {
            start_value: COUNTER.load(Ordering::Relaxed),
        }
    }

    /// Interrupt all scopes created before this call.
    #[inline]
    pub fn interrupt() {
        COUNTER.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn was_interrupted(&self) -> bool {
        COUNTER.load(Ordering::Relaxed) != self.start_value
    }

    #[inline]
    pub fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

impl Default for InterruptScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Interruptee for InterruptScope {
    fn was_interrupted(&self) -> bool {
        InterruptScope::was_interrupted(self)
    }
}
