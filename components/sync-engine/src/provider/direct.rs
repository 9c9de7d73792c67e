//! A provider fed by a transport that pushes to us (a long-lived stream,
//! a websocket, an in-process embedding) rather than one we have to poll.
//! `subscribe` just registers where to deliver; something else - the host,
//! or a socket read loop it owns - calls `notify()` when data arrives.

use super::{ChangeSink, PullResult, PushOutcome, Provider};
use crate::error::Result;
use crate::types::{PendingOp, Scope, SyncChange};
use interrupt_support::{Interruptable, InterruptHandle};
use parking_lot::Mutex;
use std::sync::Arc;

/// The two calls a direct transport still needs to make synchronously:
/// one-shot pulls (bootstrap, rescan) and pushes. Delivery of live changes
/// goes through `DirectProvider::notify` instead of this trait.
pub trait DirectBackend: Send + Sync {
    fn pull(&self, scope: &Scope, cursor: u64, limit: usize) -> Result<PullResult>;
    fn push(&self, scope: &Scope, ops: &[PendingOp]) -> Result<PushOutcome>;
    fn update_cursor(&self, _scope: &Scope, _cursor: u64) -> Result<()> {
        Ok(())
    }
}

pub struct DirectProvider<B> {
    backend: B,
    sink: Mutex<Option<Arc<dyn ChangeSink>>>,
    handle: InterruptHandle,
}

impl<B: DirectBackend> DirectProvider<B> {
    pub fn new(backend: B) -> Arc<Self> {
        Arc::new(Self {
            backend,
            sink: Mutex::new(None),
            handle: InterruptHandle::new(),
        })
    }

    /// Called by whatever owns the live transport (a socket reader, a
    /// test harness) when a batch of remote changes arrives.
    pub fn notify(&self, changes: Vec<SyncChange>, next_cursor: u64) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.on_changes(changes, next_cursor);
        }
    }

    pub fn notify_session_invalid(&self) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.on_session_invalid();
        }
    }
}

impl<B: DirectBackend + 'static> Provider for DirectProvider<B> {
    fn subscribe(self: Arc<Self>, _scope: Scope, _cursor: u64, sink: Arc<dyn ChangeSink>) -> Box<dyn Interruptable> {
        *self.sink.lock() = Some(sink);
        Box::new(self.handle.clone())
    }

    fn pull(&self, scope: &Scope, cursor: u64, limit: usize) -> Result<PullResult> {
        self.backend.pull(scope, cursor, limit)
    }

    fn push(&self, scope: &Scope, ops: &[PendingOp]) -> Result<PushOutcome> {
        self.backend.push(scope, ops)
    }

    fn update_cursor(&self, scope: &Scope, cursor: u64) -> Result<()> {
        self.backend.update_cursor(scope, cursor)
    }

    fn dispose(&self) {
        *self.sink.lock() = None;
        self.handle.interrupt();
    }
}
