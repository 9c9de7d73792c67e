//! Cooperative cancellation for the sync engine's long-running loops
//! (outbox flush, subscription polling/reconnect, gc). Nothing here
//! preempts a thread; callers must poll `was_interrupted()` at suspension
//! points the way the rest of this crate does for its blocking I/O.

mod scopes;

pub use scopes::InterruptScope;

/// Something that can be told to stop. Typically Sync + Send: created on
/// one thread, `.interrupt()` called from another (e.g. `unsubscribe()`
/// called from the owning component while a poll loop runs in the
/// background).
pub trait Interruptable: Send + Sync {
    fn interrupt(&self);
}

/// Decoupled from `Interruptable` so code that only needs to check for
/// cancellation doesn't need to know how it's triggered.
pub trait Interruptee {
    fn was_interrupted(&self) -> bool;

    fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Convenience implementation for tests and one-shot operations that have
/// no cancellation path.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverInterrupts;

impl Interruptee for NeverInterrupts {
    #[inline]
    fn was_interrupted(&self) -> bool {
        false
    }
}

/// The error returned by `err_if_interrupted`.
#[derive(Debug, thiserror::Error)]
#[error("the operation was interrupted")]
pub struct Interrupted;

/// A shared, clonable cancellation flag. `subscribe()` hands one of these
/// back disguised as the unsubscribe handle; dropping or calling
/// `interrupt()` flips the flag so the poll loop's next `was_interrupted()`
/// check exits it.
#[derive(Clone, Debug, Default)]
pub struct InterruptHandle(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interruptable for InterruptHandle {
    fn interrupt(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Interruptee for InterruptHandle {
    fn was_interrupted(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_handle() {
        let h = InterruptHandle::new();
        assert!(!h.was_interrupted());
        let h2 = h.clone();
        h2.interrupt();
        assert!(h.was_interrupted());
        assert!(h.err_if_interrupted().is_err());
    }
}
