//! Subscription manager (section 4.7): owns the provider's live connection,
//! bootstraps/rescans the cursor, and serializes every batch of incoming
//! changes through the conflict resolver, one batch at a time (the next
//! batch's `ChangeSink::on_changes` call blocks on the provider side until
//! this one returns, which is where the FIFO guarantee actually lives).

use crate::circuit_breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::cursor::CursorManager;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink, SubscriptionStatus};
use crate::provider::{ChangeSink, Provider};
use crate::resolver::ConflictResolver;
use crate::cache::RecentOpCache;
use crate::store::SyncDb;
use crate::types::{Scope, SyncChange};
use interrupt_support::{Interruptable, InterruptHandle, Interruptee};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Reconnect backoff, in seconds, indexed by consecutive-failure count.
/// The last entry repeats once exhausted, up to `MAX_RECONNECT_ATTEMPTS`.
const RECONNECT_BACKOFF_SECS: &[u64] = &[1, 2, 5, 10, 30];
const MAX_RECONNECT_ATTEMPTS: u32 = 20;

pub struct SubscriptionManager {
    db: Arc<SyncDb>,
    scope: Scope,
    provider_id: String,
    provider: Arc<dyn Provider>,
    recent_ops: Arc<RecentOpCache>,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn EventSink>,
    config: Arc<EngineConfig>,
    status: Mutex<SubscriptionStatus>,
    reconnect_attempts: AtomicUsize,
    active_handle: Mutex<Option<Box<dyn Interruptable>>>,
    lifecycle: InterruptHandle,
}

impl SubscriptionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SyncDb>,
        scope: Scope,
        provider_id: impl Into<String>,
        provider: Arc<dyn Provider>,
        recent_ops: Arc<RecentOpCache>,
        breaker: Arc<CircuitBreaker>,
        sink: Arc<dyn EventSink>,
        config: Arc<EngineConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            scope,
            provider_id: provider_id.into(),
            provider,
            recent_ops,
            breaker,
            sink,
            config,
            status: Mutex::new(SubscriptionStatus::Disconnected),
            reconnect_attempts: AtomicUsize::new(0),
            active_handle: Mutex::new(None),
            lifecycle: InterruptHandle::new(),
        })
    }

    fn breaker_key(&self) -> String {
        format!("{}:{}", self.scope, self.provider_id)
    }

    fn set_status(&self, status: SubscriptionStatus) {
        *self.status.lock() = status.clone();
        self.sink.emit(Event::SubscriptionStatusChange { status });
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status.lock().clone()
    }

    /// Full initial sync: pages through `pull()` from cursor 0 until the
    /// provider reports no more data, applying each page before asking
    /// for the next. Only called when `CursorManager::is_bootstrap_needed`.
    pub fn bootstrap(&self) -> Result<()> {
        let start = std::time::Instant::now();
        let cursor_mgr = self.cursor_manager()?;
        let mut cursor = cursor_mgr.get()?;
        loop {
            self.lifecycle.err_if_interrupted()?;
            let page = self.provider.pull(&self.scope, cursor, 500).map_err(|e| {
                self.sink.emit(Event::BootstrapError { reason: e.to_string() });
                e
            })?;
            let advanced = page.next_cursor != cursor;
            if page.has_more && !advanced {
                return Err(Error::InfiniteLoopDetected);
            }
            self.apply_batch(&page.changes)?;
            cursor = page.next_cursor;
            cursor_mgr.set(cursor)?;
            self.sink.emit(Event::BootstrapProgress { cursor });
            if !page.has_more {
                break;
            }
        }
        cursor_mgr.mark_sync_complete(now_ms())?;
        self.sink.emit(Event::BootstrapComplete {
            elapsed_ms: start.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    /// Re-pulls from the current cursor without resetting it - used when
    /// `CursorManager::is_potentially_expired` trips, as a cheaper
    /// alternative to a full bootstrap that still catches anything missed
    /// while disconnected.
    pub fn rescan(&self) -> Result<()> {
        self.bootstrap()
    }

    /// Starts (or restarts) live delivery. Drives its own reconnect state
    /// machine: `Connecting -> Connected`, and on provider error
    /// `Reconnecting` with backoff up to `MAX_RECONNECT_ATTEMPTS`, after
    /// which it gives up and reports `Error`.
    pub fn subscribe(self: &Arc<Self>) -> Result<()> {
        if self.breaker.is_open(&self.breaker_key()) {
            return Ok(());
        }
        self.set_status(SubscriptionStatus::Connecting);
        let cursor = self.cursor_manager()?.get()?;
        let sink: Arc<dyn ChangeSink> = Arc::new(SubscriptionSink { manager: self.clone() });
        let handle = self.provider.clone().subscribe(self.scope.clone(), cursor, sink);
        *self.active_handle.lock() = Some(handle);
        self.set_status(SubscriptionStatus::Connected);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.breaker.record_success(&self.breaker_key());
        Ok(())
    }

    pub fn unsubscribe(&self) {
        if let Some(handle) = self.active_handle.lock().take() {
            handle.interrupt();
        }
        self.set_status(SubscriptionStatus::Disconnected);
    }

    pub fn dispose(&self) {
        self.lifecycle.interrupt();
        self.unsubscribe();
        self.provider.dispose();
    }

    fn reconnect(self: &Arc<Self>) {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        if attempt > MAX_RECONNECT_ATTEMPTS {
            self.set_status(SubscriptionStatus::Error);
            self.sink.emit(Event::SubscriptionMaxRetriesExceeded);
            return;
        }
        self.set_status(SubscriptionStatus::Reconnecting);
        let idx = (attempt as usize - 1).min(RECONNECT_BACKOFF_SECS.len() - 1);
        let delay = Duration::from_secs(RECONNECT_BACKOFF_SECS[idx]);
        let this = self.clone();
        std::thread::spawn(move || {
            sleep_interruptible(delay, &this.lifecycle);
            if this.lifecycle.was_interrupted() {
                return;
            }
            if let Err(e) = this.subscribe() {
                log::warn!("reconnect attempt {attempt} failed for {}: {e}", this.scope);
            }
        });
    }

    /// Applies a page/batch through the conflict resolver in one
    /// transaction. The resolver is the only writer of remote state, so
    /// nothing here needs its own echo check beyond what it already does.
    fn apply_batch(&self, changes: &[SyncChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.sink.emit(Event::PullReceived { count: changes.len() });
        let resolver = ConflictResolver::new(&self.recent_ops);
        let (outcome, conflicts) = self.db.in_transaction(|tx| resolver.apply_changes(tx, changes))?;
        for c in &conflicts {
            self.sink.emit(Event::ConflictDetected {
                table: c.table.clone(),
                pk: c.pk.clone(),
                winner: c.winner,
            });
        }
        self.sink.emit(Event::PullApplied {
            applied: outcome.applied,
            skipped: outcome.skipped,
            conflicts: outcome.conflicts,
        });
        Ok(())
    }

    fn cursor_manager(&self) -> Result<CursorManager<'_>> {
        CursorManager::new(&self.db, self.scope.clone(), self.device_id())
    }

    fn device_id(&self) -> String {
        // The cursor row's device_id is informational only (section 4.3 notes it's
        // not used for conflict resolution); any stable per-process value
        // works. The capture/hlc path supplies the real one when writing.
        self.provider_id.clone()
    }
}

/// Bridges the provider's `ChangeSink` callback back into the
/// subscription's own batch-applying and reconnect logic.
struct SubscriptionSink {
    manager: Arc<SubscriptionManager>,
}

impl ChangeSink for SubscriptionSink {
    fn on_changes(&self, changes: Vec<SyncChange>, next_cursor: u64) {
        if let Err(e) = self.manager.apply_batch(&changes) {
            log::error!("failed to apply pulled batch for {}: {e}", self.manager.scope);
            return;
        }
        if let Ok(cursor_mgr) = self.manager.cursor_manager() {
            let _ = cursor_mgr.set(next_cursor);
            let _ = cursor_mgr.mark_sync_complete(now_ms());
        }
    }

    fn on_session_invalid(&self) {
        self.manager.set_status(SubscriptionStatus::Error);
        self.manager.sink.emit(Event::SubscriptionSessionInvalid);
    }

    fn on_error(&self, reason: String) {
        log::warn!("subscription error for {}: {reason}", self.manager.scope);
        self.manager.breaker.record_failure(&self.manager.breaker_key());
        self.manager.reconnect();
    }
}

fn sleep_interruptible(total: Duration, handle: &InterruptHandle) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < total && !handle.was_interrupted() {
        let remaining = total - waited;
        std::thread::sleep(step.min(remaining));
        waited += step;
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
