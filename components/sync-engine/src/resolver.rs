//! Conflict resolver (section 4.6): the only place a remote change is ever
//! applied to the local store. Last-writer-wins by clock, with the HLC as
//! the tie-break - never by wall-clock arrival order, which a slow network
//! would make nondeterministic.

use crate::cache::RecentOpCache;
use crate::error::Result;
use crate::hlc;
use crate::store::queries;
use crate::types::{ApplyOutcome, ConflictDescriptor, ConflictWinner, Operation, Record, SyncChange};
use rusqlite::Transaction;
use std::collections::HashMap;

pub struct ConflictResolver<'a> {
    recent_ops: &'a RecentOpCache,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(recent_ops: &'a RecentOpCache) -> Self {
        Self { recent_ops }
    }

    /// Applies a batch of changes inside a single transaction, grouped by
    /// table so the existing-record lookup is one bulk query per table
    /// rather than one per change.
    pub fn apply_changes(
        &self,
        tx: &Transaction<'_>,
        changes: &[SyncChange],
    ) -> Result<(ApplyOutcome, Vec<ConflictDescriptor>)> {
        let mut outcome = ApplyOutcome::default();
        let mut conflicts = Vec::new();

        let mut by_table: HashMap<&str, Vec<&SyncChange>> = HashMap::new();
        for change in changes {
            by_table.entry(change.table.as_str()).or_default().push(change);
        }

        for (table, table_changes) in by_table {
            let pks: Vec<String> = table_changes.iter().map(|c| c.pk.clone()).collect();
            let existing = queries::get_records_bulk(tx, table, &pks)?;

            for change in table_changes {
                // Echo of our own push, already reflected locally - not a
                // conflict, just a loop-back we ignore.
                if self.recent_ops.is_recent(change.stamp.op_id.as_str()) {
                    outcome.skipped += 1;
                    continue;
                }

                match self.resolve_one(tx, change, existing.get(&change.pk))? {
                    Resolution::Applied => outcome.applied += 1,
                    Resolution::SkippedStale => {
                        outcome.skipped += 1;
                        conflicts.push(ConflictDescriptor {
                            table: change.table.clone(),
                            pk: change.pk.clone(),
                            winner: ConflictWinner::Local,
                        });
                    }
                    Resolution::SkippedDuplicate => outcome.skipped += 1,
                }
            }
        }

        Ok((outcome, conflicts))
    }

    fn resolve_one(
        &self,
        tx: &Transaction<'_>,
        change: &SyncChange,
        local: Option<&Record>,
    ) -> Result<Resolution> {
        if let Some(local) = local {
            match change.stamp.clock.cmp(&local.meta.clock) {
                std::cmp::Ordering::Less => return Ok(Resolution::SkippedStale),
                std::cmp::Ordering::Equal => {
                    // Same logical clock: break the tie with the HLC.
                    // Equal on both means this is a duplicate delivery of
                    // a change we already hold (including an already-
                    // applied delete arriving twice) - idempotent, not a
                    // conflict.
                    match hlc::compare(&change.stamp.hlc, &local.meta.hlc) {
                        1 => {}                                  // remote wins, fall through
                        0 => return Ok(Resolution::SkippedDuplicate),
                        _ => return Ok(Resolution::SkippedStale),
                    }
                }
                std::cmp::Ordering::Greater => {}
            }
        }

        self.apply_winning(tx, change)?;
        Ok(Resolution::Applied)
    }

    fn apply_winning(&self, tx: &Transaction<'_>, change: &SyncChange) -> Result<()> {
        match &change.operation {
            Operation::Put { payload } => {
                let meta = crate::types::RecordMeta {
                    clock: change.stamp.clock,
                    hlc: change.stamp.hlc.clone(),
                    deleted: false,
                    deleted_at: None,
                    order_key: payload.get("order_key").and_then(|v| v.as_str()).map(String::from),
                };
                queries::put_record(tx, &change.table, &change.pk, &meta, payload)?;
                queries::clear_tombstone(tx, &change.table, &change.pk)?;
            }
            Operation::Delete => {
                let deleted_at = now_sec();
                queries::mark_record_deleted(
                    tx,
                    &change.table,
                    &change.pk,
                    change.stamp.clock,
                    &change.stamp.hlc,
                    deleted_at,
                )?;
                queries::write_tombstone(tx, &change.table, &change.pk, change.stamp.clock, deleted_at)?;
            }
        }
        Ok(())
    }
}

enum Resolution {
    Applied,
    /// The remote change lost to local state strictly newer than it -
    /// counted as a conflict for observability.
    SkippedStale,
    /// The remote change matches local state exactly - a redelivery, not
    /// a conflict.
    SkippedDuplicate,
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
    use crate::store::db::test::new_mem_db;
    use crate::types::Stamp;
    use sync_guid::Guid;

    fn stamp(op_id: &str, clock: u64, hlc: &str) -> Stamp {
        Stamp {
            device_id: "dev_remote".into(),
            op_id: Guid::from(op_id),
            hlc: hlc.into(),
            clock,
        }
    }

    #[test]
    fn test_remote_put_applies_when_no_local_record() {
        let db = new_mem_db();
        let cache = RecentOpCache::new();
        let resolver = ConflictResolver::new(&cache);
        let change = SyncChange {
            server_version: 1,
            table: "messages".into(),
            pk: "m1".into(),
            operation: Operation::Put {
                payload: serde_json::json!({"text": "hello"}),
            },
            stamp: stamp("op1", 1, "0000000000001:0000:devremote"),
        };
        let (outcome, conflicts) = db
            .in_transaction(|tx| resolver.apply_changes(tx, std::slice::from_ref(&change)))
            .unwrap();
        assert_eq!(outcome.applied, 1);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_local_newer_wins_and_is_recorded_as_conflict() {
        let db = new_mem_db();
        let cache = RecentOpCache::new();
        let resolver = ConflictResolver::new(&cache);
        db.in_transaction(|tx| {
            queries::put_record(
                tx,
                "messages",
                "m1",
                &crate::types::RecordMeta {
                    clock: 5,
                    hlc: "0000000000005:0000:devlocal0".into(),
                    deleted: false,
                    deleted_at: None,
                    order_key: None,
                },
                &serde_json::json!({"text": "local"}),
            )
        })
        .unwrap();

        let change = SyncChange {
            server_version: 1,
            table: "messages".into(),
            pk: "m1".into(),
            operation: Operation::Put {
                payload: serde_json::json!({"text": "stale remote"}),
            },
            stamp: stamp("op2", 3, "0000000000003:0000:devremote"),
        };
        let (outcome, conflicts) = db
            .in_transaction(|tx| resolver.apply_changes(tx, std::slice::from_ref(&change)))
            .unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].winner, ConflictWinner::Local);

        db.in_transaction(|tx| {
            let rec = queries::get_record(tx, "messages", "m1")?.unwrap();
            assert_eq!(rec.payload["text"], "local");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_echo_of_own_op_is_skipped_not_reapplied() {
        let db = new_mem_db();
        let cache = RecentOpCache::new();
        cache.mark("op-mine");
        let resolver = ConflictResolver::new(&cache);
        let change = SyncChange {
            server_version: 1,
            table: "messages".into(),
            pk: "m1".into(),
            operation: Operation::Put {
                payload: serde_json::json!({"text": "mine"}),
            },
            stamp: stamp("op-mine", 1, "0000000000001:0000:devlocal0"),
        };
        let (outcome, conflicts) = db
            .in_transaction(|tx| resolver.apply_changes(tx, std::slice::from_ref(&change)))
            .unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.applied, 0);
        assert!(conflicts.is_empty());
        db.in_transaction(|tx| {
            assert!(queries::get_record(tx, "messages", "m1")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_duplicate_delete_is_idempotent_not_a_conflict() {
        let db = new_mem_db();
        let cache = RecentOpCache::new();
        let resolver = ConflictResolver::new(&cache);
        let change = SyncChange {
            server_version: 1,
            table: "threads".into(),
            pk: "t1".into(),
            operation: Operation::Delete,
            stamp: stamp("op3", 2, "0000000000002:0000:devremote"),
        };
        db.in_transaction(|tx| resolver.apply_changes(tx, std::slice::from_ref(&change)))
            .unwrap();
        // Same stamp redelivered (e.g. at-least-once provider semantics).
        let (outcome, conflicts) = db
            .in_transaction(|tx| resolver.apply_changes(tx, std::slice::from_ref(&change)))
            .unwrap();
        assert_eq!(outcome.skipped, 1);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_remote_delete_beats_local_put() {
        let db = new_mem_db();
        let cache = RecentOpCache::new();
        let resolver = ConflictResolver::new(&cache);
        db.in_transaction(|tx| {
            queries::put_record(
                tx,
                "threads",
                "t1",
                &crate::types::RecordMeta {
                    clock: 1,
                    hlc: "0000000000001:0000:devlocal0".into(),
                    deleted: false,
                    deleted_at: None,
                    order_key: None,
                },
                &serde_json::json!({}),
            )
        })
        .unwrap();

        let change = SyncChange {
            server_version: 1,
            table: "threads".into(),
            pk: "t1".into(),
            operation: Operation::Delete,
            stamp: stamp("op4", 2, "0000000000002:0000:devremote"),
        };
        let (outcome, _) = db
            .in_transaction(|tx| resolver.apply_changes(tx, std::slice::from_ref(&change)))
            .unwrap();
        assert_eq!(outcome.applied, 1);
        db.in_transaction(|tx| {
            let rec = queries::get_record(tx, "threads", "t1")?.unwrap();
            assert!(rec.meta.deleted);
            let tomb = queries::get_tombstone(tx, "threads", "t1")?.unwrap();
            assert_eq!(tomb.clock, 2);
            Ok(())
        })
        .unwrap();
    }
}
