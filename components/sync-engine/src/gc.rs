//! Garbage collector (section 4.8): reclaims tombstones once they're older
//! than the retention window and have been durably synced, so the local
//! store doesn't grow without bound. Runs idly on its own interval, never
//! concurrently with itself, and backs off while the provider's circuit
//! breaker is open (no point walking tombstones the provider can't be
//! told about yet).

use crate::circuit_breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{Event, EventSink};
use crate::provider::Provider;
use crate::store::{queries, SyncDb};
use crate::types::Scope;
use interrupt_support::{Interruptable, InterruptHandle, Interruptee};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct GcManager {
    db: Arc<SyncDb>,
    scope: Scope,
    provider_id: String,
    provider: Arc<dyn Provider>,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn EventSink>,
    config: Arc<EngineConfig>,
    running: AtomicBool,
}

impl GcManager {
    pub fn new(
        db: Arc<SyncDb>,
        scope: Scope,
        provider_id: impl Into<String>,
        provider: Arc<dyn Provider>,
        breaker: Arc<CircuitBreaker>,
        sink: Arc<dyn EventSink>,
        config: Arc<EngineConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            scope,
            provider_id: provider_id.into(),
            provider,
            breaker,
            sink,
            config,
            running: AtomicBool::new(false),
        })
    }

    fn breaker_key(&self) -> String {
        format!("{}:{}", self.scope, self.provider_id)
    }

    pub fn start(self: &Arc<Self>) -> Box<dyn Interruptable> {
        let handle = InterruptHandle::new();
        let loop_handle = handle.clone();
        let this = self.clone();
        std::thread::Builder::new()
            .name(format!("sync-gc-{}", this.scope))
            .spawn(move || {
                while !loop_handle.was_interrupted() {
                    sleep_interruptible(Duration::from_millis(this.config.gc_interval_ms), &loop_handle);
                    if loop_handle.was_interrupted() {
                        break;
                    }
                    if let Err(e) = this.run_once() {
                        log::warn!("gc run failed for {}: {e}", this.scope);
                    }
                }
            })
            .expect("failed to spawn gc thread");
        Box::new(handle)
    }

    /// Single-flight: a run already in progress makes this a no-op rather
    /// than queuing another, since the next scheduled tick will pick up
    /// whatever the in-flight run didn't finish.
    pub fn run_once(&self) -> Result<usize> {
        if self.breaker.is_open(&self.breaker_key()) {
            return Ok(0);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let result = self.collect();
        self.running.store(false, Ordering::SeqCst);
        match &result {
            Ok(removed) => self.sink.emit(Event::GcComplete { tombstones_removed: *removed }),
            Err(e) => self.sink.emit(Event::GcError { reason: e.to_string() }),
        }
        result
    }

    fn collect(&self) -> Result<usize> {
        let cutoff = now_sec() - self.config.gc_retention_seconds;
        let tombstones = self.db.in_transaction(|tx| queries::get_tombstones_for_gc(tx, cutoff))?;
        if tombstones.is_empty() {
            return Ok(0);
        }

        // Give the provider a chance to compact its own change log and
        // confirm every other device has the deletes, before we drop our
        // last local record of them. Optional by contract; failure here
        // doesn't block local cleanup.
        if let Err(e) = self.provider.gc_change_log(&self.scope, cutoff) {
            log::debug!("provider gc_change_log failed for {}: {e}", self.scope);
        }
        let _ = self.provider.gc_tombstones(&self.scope, cutoff);

        let ids: Vec<String> = tombstones.iter().map(|t| t.id.clone()).collect();
        self.db.in_transaction(|tx| queries::delete_tombstones(tx, &ids))?;
        Ok(ids.len())
    }
}

fn sleep_interruptible(total: Duration, handle: &InterruptHandle) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < total && !handle.was_interrupted() {
        let remaining = total - waited;
        std::thread::sleep(step.min(remaining));
        waited += step;
    }
}

fn now_sec() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::provider::{ChangeSink, PullResult, PushOutcome};
    use crate::store::db::test::new_mem_db;
    use crate::types::PendingOp;

    struct NullProvider;
    impl Provider for NullProvider {
        fn subscribe(
            self: Arc<Self>,
            _scope: Scope,
            _cursor: u64,
            _sink: Arc<dyn ChangeSink>,
        ) -> Box<dyn Interruptable> {
            Box::new(InterruptHandle::new())
        }
        fn pull(&self, _scope: &Scope, cursor: u64, _limit: usize) -> Result<PullResult> {
            Ok(PullResult {
                changes: vec![],
                next_cursor: cursor,
                has_more: false,
            })
        }
        fn push(&self, _scope: &Scope, _ops: &[PendingOp]) -> Result<PushOutcome> {
            Ok(PushOutcome::default())
        }
        fn update_cursor(&self, _scope: &Scope, _cursor: u64) -> Result<()> {
            Ok(())
        }
        fn dispose(&self) {}
    }

    fn manager(db: Arc<SyncDb>, config: EngineConfig) -> Arc<GcManager> {
        GcManager::new(
            db,
            Scope::new("ws1"),
            "p1",
            Arc::new(NullProvider),
            Arc::new(CircuitBreaker::new()),
            Arc::new(RecordingSink::default()),
            Arc::new(config),
        )
    }

    #[test]
    fn test_collects_old_synced_tombstones() {
        let db = Arc::new(new_mem_db());
        db.in_transaction(|tx| {
            queries::write_tombstone(tx, "threads", "t1", 1, 0)?;
            queries::mark_tombstone_synced(tx, "threads", "t1", 0)
        })
        .unwrap();

        let mgr = manager(db.clone(), EngineConfig::default());
        let removed = mgr.run_once().unwrap();
        assert_eq!(removed, 1);
        db.in_transaction(|tx| {
            assert!(queries::get_tombstone(tx, "threads", "t1")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_skips_unsynced_tombstones() {
        let db = Arc::new(new_mem_db());
        db.in_transaction(|tx| queries::write_tombstone(tx, "threads", "t1", 1, 0)).unwrap();

        let mgr = manager(db.clone(), EngineConfig::default());
        let removed = mgr.run_once().unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_open_breaker_prevents_run() {
        let db = Arc::new(new_mem_db());
        db.in_transaction(|tx| {
            queries::write_tombstone(tx, "threads", "t1", 1, 0)?;
            queries::mark_tombstone_synced(tx, "threads", "t1", 0)
        })
        .unwrap();

        let mgr = manager(db.clone(), EngineConfig::default());
        for _ in 0..5 {
            mgr.breaker.record_failure(&mgr.breaker_key());
        }
        assert_eq!(mgr.run_once().unwrap(), 0);
    }
}
