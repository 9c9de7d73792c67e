//! Offline-first multi-device sync engine.
//!
//! The pieces, leaves first: [`hlc`] and [`cache`] have no dependencies on
//! the rest of the engine. [`cursor`] depends only on the local store.
//! [`capture`] depends on the hlc and the store. [`resolver`] depends on
//! the hlc's HLC comparator, the recent-op cache, and the store.
//! [`outbox`] depends on the recent-op cache, a [`provider::Provider`] and
//! a [`circuit_breaker::CircuitBreaker`]. [`subscription`] orchestrates
//! [`cursor`], [`resolver`] and a provider together; [`gc`] is the last
//! consumer, needing the store and the same circuit breaker.
//!
//! [`SyncEngine`] wires one scope's worth of these together and is the
//! only type most hosts touch directly.

pub mod cache;
pub mod capture;
pub mod circuit_breaker;
pub mod config;
pub mod cursor;
pub mod error;
pub mod events;
pub mod gc;
pub mod hlc;
pub mod outbox;
pub mod provider;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod types;

use std::path::Path;
use std::sync::Arc;

pub use error::{Error, Result};

use circuit_breaker::CircuitBreaker;
use config::EngineConfig;
use cursor::CursorManager;
use events::{EventSink, NoopSink};
use gc::GcManager;
use hlc::Hlc;
use outbox::OutboxManager;
use provider::Provider;
use cache::RecentOpCache;
use store::{SqliteDeviceIdStore, SyncDb};
use subscription::SubscriptionManager;
use types::Scope;

/// One scope's worth of wired-up sync machinery: the local store, clock,
/// echo cache, and the three background loops (outbox, subscription, gc),
/// all pointed at one [`Provider`].
pub struct SyncEngine {
    db: Arc<SyncDb>,
    scope: Scope,
    hlc: Arc<Hlc>,
    recent_ops: Arc<RecentOpCache>,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn EventSink>,
    config: Arc<EngineConfig>,
    outbox: Arc<OutboxManager>,
    subscription: Arc<SubscriptionManager>,
    gc: Arc<GcManager>,
    scheduler: scheduler::Scheduler,
}

impl SyncEngine {
    /// Opens (or creates) the local store at `path` and wires it to
    /// `provider` for `scope`. The device id is persisted in the store
    /// itself, so it survives restarts without the host needing a
    /// separate `DeviceIdStore`.
    pub fn open(
        path: impl AsRef<Path>,
        scope: Scope,
        provider_id: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Result<Self> {
        let db = Arc::new(SyncDb::open(path)?);
        Self::new(db, scope, provider_id, provider, Arc::new(EngineConfig::default()), Arc::new(NoopSink))
    }

    pub fn open_in_memory(
        scope: Scope,
        provider_id: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Result<Self> {
        let db = Arc::new(SyncDb::open_in_memory()?);
        Self::new(db, scope, provider_id, provider, Arc::new(EngineConfig::default()), Arc::new(NoopSink))
    }

    pub fn new(
        db: Arc<SyncDb>,
        scope: Scope,
        provider_id: impl Into<String>,
        provider: Arc<dyn Provider>,
        config: Arc<EngineConfig>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let provider_id = provider_id.into();
        let device_id_store = SqliteDeviceIdStore { db: &db };
        let hlc = Arc::new(Hlc::new(&device_id_store));
        let recent_ops = Arc::new(RecentOpCache::new());
        let breaker = Arc::new(CircuitBreaker::new());

        let outbox = OutboxManager::new(
            db.clone(),
            scope.clone(),
            provider_id.clone(),
            provider.clone(),
            recent_ops.clone(),
            breaker.clone(),
            sink.clone(),
            config.clone(),
        );
        let subscription = SubscriptionManager::new(
            db.clone(),
            scope.clone(),
            provider_id.clone(),
            provider.clone(),
            recent_ops.clone(),
            breaker.clone(),
            sink.clone(),
            config.clone(),
        );
        let gc = GcManager::new(
            db.clone(),
            scope.clone(),
            provider_id,
            provider,
            breaker.clone(),
            sink.clone(),
            config.clone(),
        );

        Ok(Self {
            db,
            scope,
            hlc,
            recent_ops,
            breaker,
            sink,
            config,
            outbox,
            subscription,
            gc,
            scheduler: scheduler::Scheduler::new(),
        })
    }

    /// Brings the engine fully online: crash recovery, bootstrap (if the
    /// cursor is fresh) or rescan (if it's potentially stale), then starts
    /// the live subscription and the outbox/gc background loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.outbox.recover()?;

        let cursor_mgr = CursorManager::new(&self.db, self.scope.clone(), self.hlc.device_id().to_string())?;
        if cursor_mgr.is_bootstrap_needed()? {
            self.subscription.bootstrap()?;
        } else if cursor_mgr.is_potentially_expired(now_ms(), self.config.cursor_max_age_ms)? {
            self.subscription.rescan()?;
        }

        self.subscription.subscribe()?;
        self.scheduler.track(self.outbox.start());
        self.scheduler.track(self.gc.start());
        Ok(())
    }

    pub fn stop(&self) {
        self.scheduler.shutdown();
        self.subscription.dispose();
    }

    /// Writes an application record through the sync machinery: the
    /// record itself plus its pending op land in `f`'s transaction
    /// atomically. `clock` is the new clock value the caller's own write
    /// logic assigned this record (typically `previous.clock + 1`).
    pub fn put<T>(
        &self,
        table: &str,
        pk: &str,
        clock: u64,
        payload: serde_json::Value,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.db.in_transaction(|tx| {
            let bridge = capture::WriteCaptureBridge::new(&self.config, &self.hlc, self.sink.as_ref());
            bridge.capture_put(tx, table, pk, clock, payload)?;
            let result = f(tx)?;
            self.outbox.notify();
            Ok(result)
        })
    }

    pub fn delete<T>(
        &self,
        table: &str,
        pk: &str,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.db.in_transaction(|tx| {
            let bridge = capture::WriteCaptureBridge::new(&self.config, &self.hlc, self.sink.as_ref());
            bridge.capture_delete(tx, table, pk)?;
            let result = f(tx)?;
            self.outbox.notify();
            Ok(result)
        })
    }

    pub fn get_record(&self, table: &str, pk: &str) -> Result<Option<types::Record>> {
        self.db.in_transaction(|tx| store::queries::get_record(tx, table, pk))
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.outbox.get_pending_count()
    }

    pub fn failed_ops(&self) -> Result<Vec<types::PendingOp>> {
        self.outbox.get_failed_ops()
    }

    pub fn retry_failed(&self) -> Result<usize> {
        self.outbox.retry_failed()
    }

    pub fn purge_corrupt_ops(&self) -> Result<usize> {
        self.outbox.purge_corrupt_ops()
    }

    pub fn device_id(&self) -> &str {
        self.hlc.device_id()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
