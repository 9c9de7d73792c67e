//! Per-scope cursor manager (section 4.3): the persisted server-version
//! watermark, plus the staleness check that drives `rescan()`.

use crate::error::Result;
use crate::store::{queries, SyncDb};
use crate::types::Scope;

pub struct CursorManager<'a> {
    db: &'a SyncDb,
    scope: Scope,
    device_id: String,
}

impl<'a> CursorManager<'a> {
    pub fn new(db: &'a SyncDb, scope: Scope, device_id: String) -> Result<Self> {
        let mgr = Self {
            db,
            scope,
            device_id,
        };
        mgr.db.in_transaction(|tx| {
            queries::ensure_sync_state(tx, &mgr.scope.state_id(), &mgr.device_id)?;
            Ok(())
        })?;
        Ok(mgr)
    }

    pub fn get(&self) -> Result<u64> {
        self.db.in_transaction(|tx| {
            let row = queries::ensure_sync_state(tx, &self.scope.state_id(), &self.device_id)?;
            Ok(row.cursor)
        })
    }

    /// Advances the cursor. Per section 4.3 a caller-supplied regression is
    /// refused (logged) rather than applied - the source of truth,
    /// `serverVersion`, is defined to be strictly increasing, so a
    /// regression here means a bug upstream, not a legitimate rewind.
    pub fn set(&self, value: u64) -> Result<()> {
        self.db.in_transaction(|tx| {
            let row = queries::ensure_sync_state(tx, &self.scope.state_id(), &self.device_id)?;
            if value < row.cursor {
                log::warn!(
                    "refusing to regress cursor for {} from {} to {}",
                    self.scope,
                    row.cursor,
                    value
                );
                return Ok(());
            }
            queries::set_cursor(tx, &self.scope.state_id(), value)
        })
    }

    pub fn last_sync_at(&self) -> Result<i64> {
        self.db.in_transaction(|tx| {
            let row = queries::ensure_sync_state(tx, &self.scope.state_id(), &self.device_id)?;
            Ok(row.last_sync_at)
        })
    }

    pub fn mark_sync_complete(&self, now_ms: i64) -> Result<()> {
        self.db
            .in_transaction(|tx| queries::mark_sync_complete(tx, &self.scope.state_id(), now_ms))
    }

    pub fn is_bootstrap_needed(&self) -> Result<bool> {
        Ok(self.get()? == 0)
    }

    pub fn is_potentially_expired(&self, now_ms: i64, max_age_ms: i64) -> Result<bool> {
        let last = self.last_sync_at()?;
        Ok(last != 0 && now_ms - last > max_age_ms)
    }

    pub fn reset(&self) -> Result<()> {
        self.db
            .in_transaction(|tx| queries::reset_cursor(tx, &self.scope.state_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::test::new_mem_db;

    fn mgr(db: &SyncDb) -> CursorManager<'_> {
        CursorManager::new(db, Scope::new("ws1"), "dev00001".into()).unwrap()
    }

    #[test]
    fn test_bootstrap_needed_initially() {
        let db = new_mem_db();
        let m = mgr(&db);
        assert!(m.is_bootstrap_needed().unwrap());
        assert_eq!(m.get().unwrap(), 0);
    }

    #[test]
    fn test_set_and_get() {
        let db = new_mem_db();
        let m = mgr(&db);
        m.set(100).unwrap();
        assert_eq!(m.get().unwrap(), 100);
        assert!(!m.is_bootstrap_needed().unwrap());
    }

    #[test]
    fn test_refuses_regression() {
        let db = new_mem_db();
        let m = mgr(&db);
        m.set(100).unwrap();
        m.set(50).unwrap();
        assert_eq!(m.get().unwrap(), 100);
    }

    #[test]
    fn test_expiry() {
        let db = new_mem_db();
        let m = mgr(&db);
        assert!(!m.is_potentially_expired(1_000_000, 24 * 60 * 60 * 1000).unwrap());
        m.mark_sync_complete(1_000).unwrap();
        assert!(!m.is_potentially_expired(1_000 + 1000, 24 * 60 * 60 * 1000).unwrap());
        let day_ms = 24 * 60 * 60 * 1000;
        assert!(m.is_potentially_expired(1_000 + day_ms + 1, day_ms).unwrap());
    }

    #[test]
    fn test_reset() {
        let db = new_mem_db();
        let m = mgr(&db);
        m.set(100).unwrap();
        m.mark_sync_complete(5000).unwrap();
        m.reset().unwrap();
        assert_eq!(m.get().unwrap(), 0);
        assert_eq!(m.last_sync_at().unwrap(), 0);
    }
}
