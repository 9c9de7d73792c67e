//! A provider fed by polling: no push channel exists, so `subscribe` owns
//! a background thread that calls `pull()` on an interval, drains any
//! backlog the response reports (`has_more`) before sleeping again, and
//! backs off on a rate limit.
//!
//! Backpressure comes for free: `ChangeSink::on_changes` is a plain
//! synchronous call, so the poll loop blocks on whatever work the caller
//! does with a batch before it pulls the next page.

use super::{ChangeSink, PullResult, PushOutcome, Provider};
use crate::error::{Error, Result};
use crate::types::{PendingOp, Scope, SyncChange};
use interrupt_support::{Interruptable, InterruptHandle, Interruptee};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

pub trait GatewayBackend: Send + Sync {
    fn pull(&self, scope: &Scope, cursor: u64, limit: usize) -> Result<PullResult>;
    fn push(&self, scope: &Scope, ops: &[PendingOp]) -> Result<PushOutcome>;
    fn update_cursor(&self, _scope: &Scope, _cursor: u64) -> Result<()> {
        Ok(())
    }
}

const PULL_PAGE_SIZE: usize = 200;

pub struct GatewayProvider<B> {
    backend: B,
    poll_interval_ms: u64,
}

impl<B: GatewayBackend + 'static> GatewayProvider<B> {
    pub fn new(backend: B, poll_interval_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            backend,
            poll_interval_ms,
        })
    }

    fn poll_loop(&self, scope: Scope, mut cursor: u64, sink: Arc<dyn ChangeSink>, handle: InterruptHandle) {
        while !handle.was_interrupted() {
            match self.backend.pull(&scope, cursor, PULL_PAGE_SIZE) {
                Ok(result) => {
                    let advanced = result.next_cursor != cursor;
                    if !result.changes.is_empty() || advanced {
                        cursor = result.next_cursor;
                        sink.on_changes(result.changes, cursor);
                    }
                    if result.has_more && advanced {
                        // Backlog remains; drain it without sleeping.
                        continue;
                    }
                    if result.has_more && !advanced {
                        sink.on_error("provider reported more data without advancing the cursor".into());
                    }
                }
                Err(Error::SessionInvalid) => {
                    sink.on_session_invalid();
                    return;
                }
                Err(Error::Provider(msg)) => {
                    if let Some(wait_secs) = parse_retry_after_seconds(&msg) {
                        sink.on_error(msg);
                        sleep_interruptible(Duration::from_secs(wait_secs), &handle);
                        continue;
                    }
                    sink.on_error(msg);
                }
                Err(e) => sink.on_error(e.to_string()),
            }
            sleep_with_jitter(self.poll_interval_ms, &handle);
        }
    }
}

impl<B: GatewayBackend + 'static> Provider for GatewayProvider<B> {
    fn subscribe(self: Arc<Self>, scope: Scope, cursor: u64, sink: Arc<dyn ChangeSink>) -> Box<dyn Interruptable> {
        let handle = InterruptHandle::new();
        let loop_handle = handle.clone();
        let provider = self;
        std::thread::Builder::new()
            .name(format!("sync-gateway-poll-{scope}"))
            .spawn(move || provider.poll_loop(scope, cursor, sink, loop_handle))
            .expect("failed to spawn gateway poll thread");
        Box::new(handle)
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

    fn dispose(&self) {}
}

/// Backends encode a 429 as `Error::Provider("429 retry-after:<seconds>")`;
/// anything else just falls through to the normal poll-interval backoff.
fn parse_retry_after_seconds(msg: &str) -> Option<u64> {
    if !msg.starts_with("429") {
        return None;
    }
    msg.split("retry-after:").nth(1)?.trim().parse().ok()
}

fn sleep_with_jitter(base_ms: u64, handle: &InterruptHandle) {
    let jitter_ms = rand::thread_rng().gen_range(0..=(base_ms / 4).max(1));
    sleep_interruptible(Duration::from_millis(base_ms + jitter_ms), handle);
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
