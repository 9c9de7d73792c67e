//! Outbox manager (section 4.5): drains `pending_ops` to the active provider.
//! Coalesces bursts of local writes into one flush via a condvar (multiple
//! `notify()` calls before the worker wakes collapse into a single wake),
//! retries transient per-op failures with the configured backoff table,
//! and opens the shared circuit breaker on transport-level failures.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{Event, EventSink};
use crate::provider::Provider;
use crate::cache::RecentOpCache;
use crate::store::{queries, SyncDb};
use crate::types::{PendingOp, Scope};
use interrupt_support::{Interruptable, Interruptee};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct OutboxManager {
    db: Arc<SyncDb>,
    scope: Scope,
    provider_id: String,
    provider: Arc<dyn Provider>,
    recent_ops: Arc<RecentOpCache>,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn EventSink>,
    config: Arc<EngineConfig>,
    flushing: AtomicBool,
    wake: (Mutex<bool>, Condvar),
}

impl OutboxManager {
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
            flushing: AtomicBool::new(false),
            wake: (Mutex::new(false), Condvar::new()),
        })
    }

    fn breaker_key(&self) -> String {
        format!("{}:{}", self.scope, self.provider_id)
    }

    /// Crash recovery, run once at engine startup before the flush loop
    /// begins: any op left `syncing` from a process that died mid-push is
    /// requeued as `pending` so it isn't stranded forever.
    pub fn recover(&self) -> Result<usize> {
        self.db.in_transaction(|tx| queries::reset_syncing_to_pending(tx, now_ms()))
    }

    /// Signals that new work may be available. Safe to call from any
    /// thread (the capture path calls this right after committing a
    /// write); multiple calls before the worker wakes coalesce into one
    /// flush instead of one each.
    pub fn notify(&self) {
        let (lock, cv) = &self.wake;
        *lock.lock() = true;
        cv.notify_one();
    }

    /// Spawns the background flush loop. Interrupting the returned handle
    /// stops it after its current flush (if any) finishes.
    pub fn start(self: &Arc<Self>) -> Box<dyn Interruptable> {
        let handle = interrupt_support::InterruptHandle::new();
        let loop_handle = handle.clone();
        let this = self.clone();
        std::thread::Builder::new()
            .name(format!("sync-outbox-{}", this.scope))
            .spawn(move || this.run_loop(loop_handle))
            .expect("failed to spawn outbox thread");
        Box::new(handle)
    }

    fn run_loop(&self, handle: impl Interruptee) {
        while !handle.was_interrupted() {
            if let Err(e) = self.flush_once() {
                log::error!("outbox flush failed for {}: {e}", self.scope);
            }
            let (lock, cv) = &self.wake;
            let mut signaled = lock.lock();
            if !*signaled {
                cv.wait_for(&mut signaled, Duration::from_millis(self.config.flush_interval_ms));
            }
            *signaled = false;
        }
    }

    /// Runs at most one flush: fetch a batch, push it, reconcile results.
    /// Reentrant-safe (a concurrent call while one is in flight is a
    /// no-op) and circuit-breaker-gated.
    pub fn flush_once(&self) -> Result<()> {
        if self.breaker.is_open(&self.breaker_key()) {
            return Ok(());
        }
        if self.flushing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.do_flush();
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    fn do_flush(&self) -> Result<()> {
        let now = now_ms();
        let ops = self
            .db
            .in_transaction(|tx| queries::get_pending_ops(tx, self.config.max_batch_size, now))?;
        if ops.is_empty() {
            return Ok(());
        }
        let total_pending = self.db.in_transaction(|tx| queries::count_pending(tx))?;
        if total_pending >= self.config.max_pending_ops_warning {
            self.sink.emit(Event::QueueFull { pending: total_pending });
        }

        let ids: Vec<String> = ops.iter().map(|o| o.id.as_str().to_string()).collect();
        self.db.in_transaction(|tx| queries::mark_ops_syncing(tx, &ids))?;

        // Mark every op's id as recently-pushed *before* calling the
        // provider, not after it acks: the server can echo an op back
        // through pull/subscribe before our own `push` call here even
        // returns, and the resolver needs the echo cache populated by
        // the time that happens to avoid recomputing a conflict against
        // our own write.
        for op in &ops {
            self.recent_ops.mark(op.stamp.op_id.as_str());
        }
        self.sink.emit(Event::PushBefore { batch_size: ops.len() });

        match self.provider.push(&self.scope, &ops) {
            Ok(outcome) => {
                let batch_was_full = ops.len() == self.config.max_batch_size;
                let (succeeded, failed) = self.db.in_transaction(|tx| {
                    let mut succeeded = 0usize;
                    let mut failed = 0usize;
                    for op in &ops {
                        let id_str = op.id.as_str();
                        if outcome.acked.iter().any(|a| a == id_str) {
                            queries::delete_pending_op(tx, id_str)?;
                            succeeded += 1;
                        } else if let Some(rejected) =
                            outcome.rejected.iter().find(|r| r.op_id == id_str)
                        {
                            self.reject_one(tx, op, rejected.permanent, &rejected.reason)?;
                            failed += 1;
                        } else {
                            // Provider contract violation: op neither acked
                            // nor rejected. Treat as transient so it isn't
                            // silently lost.
                            self.retry_one(tx, op)?;
                            failed += 1;
                        }
                    }
                    Ok((succeeded, failed))
                })?;
                self.breaker.record_success(&self.breaker_key());
                self.sink.emit(Event::PushAfter { succeeded, failed });
                if batch_was_full {
                    self.notify();
                }
                Ok(())
            }
            Err(e) => {
                self.db.in_transaction(|tx| queries::reset_syncing_to_pending(tx, now))?;
                self.breaker.record_failure(&self.breaker_key());
                self.sink.emit(Event::PushError {
                    op_id: String::new(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn reject_one(
        &self,
        tx: &rusqlite::Transaction<'_>,
        op: &PendingOp,
        permanent: bool,
        reason: &str,
    ) -> Result<()> {
        let id_str = op.id.as_str();
        if permanent {
            queries::mark_op_failed(tx, id_str, op.attempts + 1)?;
            self.sink.emit(Event::PushError {
                op_id: id_str.to_string(),
                reason: reason.to_string(),
            });
            Ok(())
        } else {
            self.retry_one(tx, op)
        }
    }

    fn retry_one(&self, tx: &rusqlite::Transaction<'_>, op: &PendingOp) -> Result<()> {
        let id_str = op.id.as_str();
        let attempts = op.attempts + 1;
        let delays = &self.config.retry_delays_ms;
        if attempts as usize > delays.len() {
            queries::mark_op_failed(tx, id_str, attempts)?;
            return Ok(());
        }
        let delay_ms = delays[attempts as usize - 1];
        let next_attempt_at = now_ms() + delay_ms as i64;
        queries::schedule_retry(tx, id_str, attempts, next_attempt_at)?;
        self.sink.emit(Event::Retry {
            op_id: id_str.to_string(),
            attempts,
            next_attempt_at,
        });
        Ok(())
    }

    // ---- admin operations (section 6) ----

    pub fn get_pending_count(&self) -> Result<usize> {
        self.db.in_transaction(|tx| queries::count_pending(tx))
    }

    pub fn get_failed_ops(&self) -> Result<Vec<PendingOp>> {
        self.db.in_transaction(|tx| queries::get_failed_ops(tx))
    }

    pub fn retry_failed(&self) -> Result<usize> {
        let n = self.db.in_transaction(|tx| queries::retry_failed_ops(tx))?;
        if n > 0 {
            self.notify();
        }
        Ok(n)
    }

    pub fn purge_corrupt_ops(&self) -> Result<usize> {
        self.db.in_transaction(|tx| queries::purge_failed_ops(tx))
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::events::RecordingSink;
    use crate::provider::{ChangeSink, PullResult, PushOutcome, RejectedOp};
    use crate::store::db::test::new_mem_db;
    use crate::types::{Operation, PendingStatus, Stamp};
    use parking_lot::Mutex as PMutex;
    use sync_guid::Guid;

    struct ScriptedProvider {
        calls: PMutex<Vec<Vec<String>>>,
        responses: PMutex<Vec<Result<PushOutcome>>>,
    }

    impl Provider for ScriptedProvider {
        fn subscribe(
            self: Arc<Self>,
            _scope: Scope,
            _cursor: u64,
            _sink: Arc<dyn ChangeSink>,
        ) -> Box<dyn Interruptable> {
            Box::new(interrupt_support::InterruptHandle::new())
        }
        fn pull(&self, _scope: &Scope, cursor: u64, _limit: usize) -> Result<PullResult> {
            Ok(PullResult {
                changes: vec![],
                next_cursor: cursor,
                has_more: false,
            })
        }
        fn push(&self, _scope: &Scope, ops: &[PendingOp]) -> Result<PushOutcome> {
            self.calls
                .lock()
                .push(ops.iter().map(|o| o.id.as_str().to_string()).collect());
            self.responses.lock().remove(0)
        }
        fn update_cursor(&self, _scope: &Scope, _cursor: u64) -> Result<()> {
            Ok(())
        }
        fn dispose(&self) {}
    }

    fn sample_op(pk: &str) -> PendingOp {
        PendingOp {
            id: Guid::random(),
            table: "threads".into(),
            pk: pk.into(),
            operation: Operation::Delete,
            stamp: Stamp {
                device_id: "dev1".into(),
                op_id: Guid::random(),
                hlc: "h".into(),
                clock: 1,
            },
            created_at: 0,
            attempts: 0,
            status: PendingStatus::Pending,
            next_attempt_at: None,
        }
    }

    fn manager(db: Arc<SyncDb>, provider: Arc<ScriptedProvider>, sink: Arc<RecordingSink>) -> Arc<OutboxManager> {
        OutboxManager::new(
            db,
            Scope::new("ws1"),
            "p1",
            provider,
            Arc::new(RecentOpCache::new()),
            Arc::new(CircuitBreaker::new()),
            sink,
            Arc::new(EngineConfig::default()),
        )
    }

    #[test]
    fn test_flush_acks_delete_pending_op() {
        let db = Arc::new(new_mem_db());
        let op = sample_op("t1");
        db.in_transaction(|tx| queries::insert_pending_op(tx, &op)).unwrap();

        let provider = Arc::new(ScriptedProvider {
            calls: PMutex::new(vec![]),
            responses: PMutex::new(vec![Ok(PushOutcome {
                acked: vec![op.id.as_str().to_string()],
                rejected: vec![],
            })]),
        });
        let sink = Arc::new(RecordingSink::default());
        let mgr = manager(db.clone(), provider, sink);
        mgr.flush_once().unwrap();

        assert_eq!(mgr.get_pending_count().unwrap(), 0);
    }

    #[test]
    fn test_transient_rejection_schedules_retry() {
        let db = Arc::new(new_mem_db());
        let op = sample_op("t1");
        db.in_transaction(|tx| queries::insert_pending_op(tx, &op)).unwrap();

        let provider = Arc::new(ScriptedProvider {
            calls: PMutex::new(vec![]),
            responses: PMutex::new(vec![Ok(PushOutcome {
                acked: vec![],
                rejected: vec![RejectedOp {
                    op_id: op.id.as_str().to_string(),
                    permanent: false,
                    reason: "rate limited".into(),
                }],
            })]),
        });
        let sink = Arc::new(RecordingSink::default());
        let mgr = manager(db.clone(), provider, sink);
        mgr.flush_once().unwrap();

        let failed = db.in_transaction(|tx| queries::get_failed_ops(tx)).unwrap();
        assert!(failed.is_empty());
        // Not immediately re-fetchable: backoff hasn't elapsed.
        let now = now_ms();
        let fetched = db.in_transaction(|tx| queries::get_pending_ops(tx, 10, now)).unwrap();
        assert!(fetched.is_empty());
    }

    #[test]
    fn test_permanent_rejection_marks_failed() {
        let db = Arc::new(new_mem_db());
        let op = sample_op("t1");
        db.in_transaction(|tx| queries::insert_pending_op(tx, &op)).unwrap();

        let provider = Arc::new(ScriptedProvider {
            calls: PMutex::new(vec![]),
            responses: PMutex::new(vec![Ok(PushOutcome {
                acked: vec![],
                rejected: vec![RejectedOp {
                    op_id: op.id.as_str().to_string(),
                    permanent: true,
                    reason: "payload too large".into(),
                }],
            })]),
        });
        let sink = Arc::new(RecordingSink::default());
        let mgr = manager(db.clone(), provider, sink);
        mgr.flush_once().unwrap();

        let failed = mgr.get_failed_ops().unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn test_transport_failure_opens_breaker_and_requeues() {
        let db = Arc::new(new_mem_db());
        let op = sample_op("t1");
        db.in_transaction(|tx| queries::insert_pending_op(tx, &op)).unwrap();

        let provider = Arc::new(ScriptedProvider {
            calls: PMutex::new(vec![]),
            responses: PMutex::new(vec![Err(Error::PushTransientFailure("network down".into()))]),
        });
        let sink = Arc::new(RecordingSink::default());
        let mgr = manager(db.clone(), provider, sink);
        assert!(mgr.flush_once().is_err());
        assert_eq!(mgr.get_pending_count().unwrap(), 1);
    }

    #[test]
    fn test_retry_failed_requeues_and_purge_clears() {
        let db = Arc::new(new_mem_db());
        let op = sample_op("t1");
        db.in_transaction(|tx| {
            queries::insert_pending_op(tx, &op)?;
            queries::mark_op_failed(tx, op.id.as_str(), 5)
        })
        .unwrap();

        let provider = Arc::new(ScriptedProvider {
            calls: PMutex::new(vec![]),
            responses: PMutex::new(vec![]),
        });
        let sink = Arc::new(RecordingSink::default());
        let mgr = manager(db.clone(), provider, sink);
        assert_eq!(mgr.retry_failed().unwrap(), 1);
        assert_eq!(mgr.get_pending_count().unwrap(), 1);

        db.in_transaction(|tx| queries::mark_op_failed(tx, op.id.as_str(), 6)).unwrap();
        assert_eq!(mgr.purge_corrupt_ops().unwrap(), 1);
        assert_eq!(mgr.get_failed_ops().unwrap().len(), 0);
    }
}
