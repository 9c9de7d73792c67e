//! The provider boundary (section 6): everything the engine needs from a
//! transport, and nothing more. `direct` and `gateway` are the two shapes
//! observed in practice - a provider that can push changes to the client
//! itself, and one the client must poll - `registry` is how a host looks
//! up the active one for a scope.

pub mod direct;
pub mod gateway;
pub mod registry;

use crate::error::Result;
use crate::types::{PendingOp, Scope, SyncChange};
use interrupt_support::Interruptable;
use std::sync::Arc;

/// What a pull returns: a page of changes plus whether the provider has
/// more beyond `next_cursor`. `has_more` without `next_cursor` moving past
/// the cursor the caller sent is a guarantee violation the subscription
/// manager refuses to loop on (`Error::InfiniteLoopDetected`).
#[derive(Debug, Clone)]
pub struct PullResult {
    pub changes: Vec<SyncChange>,
    pub next_cursor: u64,
    pub has_more: bool,
}

/// Per-op outcome of a push attempt. An op not present in either list is a
/// contract violation by the provider and is treated as a transient
/// failure by the outbox (so it's retried rather than silently dropped).
#[derive(Debug, Clone, Default)]
pub struct PushOutcome {
    pub acked: Vec<String>,
    pub rejected: Vec<RejectedOp>,
}

#[derive(Debug, Clone)]
pub struct RejectedOp {
    pub op_id: String,
    pub permanent: bool,
    pub reason: String,
}

/// Delivered to `Provider::subscribe`'s callback for every pushed or
/// polled batch of remote changes.
pub trait ChangeSink: Send + Sync {
    fn on_changes(&self, changes: Vec<SyncChange>, next_cursor: u64);
    fn on_session_invalid(&self);
    fn on_error(&self, reason: String);
}

/// The synchronous transport contract every provider implements. Object
/// safe so the engine can hold `Arc<dyn Provider>` without knowing which
/// concrete transport is behind it.
pub trait Provider: Send + Sync {
    /// Begin delivering changes past `cursor` to `sink`, returning a
    /// handle the caller can use to stop delivery. Implementations that
    /// poll run their loop on a background thread; implementations that
    /// are pushed to (a long-lived stream) register `sink` and return
    /// immediately.
    fn subscribe(
        self: Arc<Self>,
        scope: Scope,
        cursor: u64,
        sink: Arc<dyn ChangeSink>,
    ) -> Box<dyn Interruptable>;

    /// One-shot page fetch, used for bootstrap and explicit rescans.
    fn pull(&self, scope: &Scope, cursor: u64, limit: usize) -> Result<PullResult>;

    /// Upload a batch of pending ops. A `Result::Err` here means the whole
    /// batch failed at the transport level (network down, 5xx) and every
    /// op should be retried; per-op accept/reject decisions go in the
    /// returned `PushOutcome`.
    fn push(&self, scope: &Scope, ops: &[PendingOp]) -> Result<PushOutcome>;

    /// Informs the provider the client has durably applied up through
    /// `cursor`, letting a gateway-style provider trim what it must keep
    /// available for replay.
    fn update_cursor(&self, scope: &Scope, cursor: u64) -> Result<()>;

    fn dispose(&self);

    /// Optional: ask the provider to drop tombstones it knows were
    /// accepted by every other device before `cutoff`. Not every
    /// transport can answer this; default is a no-op.
    fn gc_tombstones(&self, _scope: &Scope, _cutoff: i64) -> Result<usize> {
        Ok(0)
    }

    /// Optional: ask the provider to compact its own change log before
    /// `cutoff`. Default is a no-op.
    fn gc_change_log(&self, _scope: &Scope, _cutoff: i64) -> Result<()> {
        Ok(())
    }
}
