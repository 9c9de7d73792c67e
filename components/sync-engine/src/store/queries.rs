//! The local store's transactional and indexed-query contract (section 3/section 6),
//! implemented against the concrete schema in `schema.rs`. Every function
//! here is generic over `sql_support::ConnExt` so it works identically
//! against a bare `Connection` (read paths) or a `Transaction` (anything
//! that needs to be atomic with a sibling write).

use crate::error::Result;
use crate::types::*;
use rusqlite::{params, OptionalExtension, Row};
use sql_support::ConnExt;
use std::collections::HashMap;
use sync_guid::Guid;

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Record> {
    let payload_text: String = row.get("payload")?;
    let payload: serde_json::Value =
        serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null);
    Ok(Record {
        table: row.get("table_name")?,
        pk: row.get("pk")?,
        meta: RecordMeta {
            clock: row.get::<_, i64>("clock")? as u64,
            hlc: row.get("hlc")?,
            deleted: row.get::<_, i64>("deleted")? != 0,
            deleted_at: row.get("deleted_at")?,
            order_key: row.get("order_key")?,
        },
        payload,
    })
}

pub fn get_record(conn: &impl ConnExt, table: &str, pk: &str) -> Result<Option<Record>> {
    Ok(conn
        .conn()
        .query_row(
            "SELECT table_name, pk, payload, clock, hlc, deleted, deleted_at, order_key
             FROM records WHERE table_name = ? AND pk = ?",
            params![table, pk],
            row_to_record,
        )
        .optional()?)
}

/// Bulk `get` keyed by `(table, pk)`, as section 4.6 calls for before iterating a
/// change batch - one query per distinct table rather than one per change.
pub fn get_records_bulk(
    conn: &impl ConnExt,
    table: &str,
    pks: &[String],
) -> Result<HashMap<String, Record>> {
    let mut out = HashMap::new();
    if pks.is_empty() {
        return Ok(out);
    }
    sql_support::each_chunk(pks, |chunk, _offset| -> Result<()> {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT table_name, pk, payload, clock, hlc, deleted, deleted_at, order_key
             FROM records WHERE table_name = ? AND pk IN ({placeholders})"
        );
        let mut stmt = conn.conn().prepare(&sql)?;
        let mut all_params: Vec<&dyn rusqlite::types::ToSql> = vec![&table];
        all_params.extend(chunk.iter().copied());
        let rows = stmt.query_map(all_params.as_slice(), row_to_record)?;
        for row in rows {
            let rec = row?;
            out.insert(rec.pk.clone(), rec);
        }
        Ok(())
    })?;
    Ok(out)
}

pub fn put_record(
    conn: &impl ConnExt,
    table: &str,
    pk: &str,
    meta: &RecordMeta,
    payload: &serde_json::Value,
) -> Result<()> {
    conn.conn().execute(
        "INSERT INTO records (table_name, pk, payload, clock, hlc, deleted, deleted_at, order_key)
         VALUES (?, ?, ?, ?, ?, 0, NULL, ?)
         ON CONFLICT(table_name, pk) DO UPDATE SET
            payload = excluded.payload,
            clock = excluded.clock,
            hlc = excluded.hlc,
            deleted = 0,
            deleted_at = NULL,
            order_key = excluded.order_key",
        params![
            table,
            pk,
            serde_json::to_string(payload)?,
            meta.clock as i64,
            meta.hlc,
            meta.order_key,
        ],
    )?;
    Ok(())
}

pub fn mark_record_deleted(
    conn: &impl ConnExt,
    table: &str,
    pk: &str,
    clock: u64,
    hlc: &str,
    deleted_at: i64,
) -> Result<()> {
    conn.conn().execute(
        "INSERT INTO records (table_name, pk, payload, clock, hlc, deleted, deleted_at, order_key)
         VALUES (?, ?, '{}', ?, ?, 1, ?, NULL)
         ON CONFLICT(table_name, pk) DO UPDATE SET
            clock = excluded.clock,
            hlc = excluded.hlc,
            deleted = 1,
            deleted_at = excluded.deleted_at",
        params![table, pk, clock as i64, hlc, deleted_at],
    )?;
    Ok(())
}

// ---- tombstones ----

pub fn get_tombstone(conn: &impl ConnExt, table: &str, pk: &str) -> Result<Option<Tombstone>> {
    Ok(conn
        .conn()
        .query_row(
            "SELECT id, table_name, pk, deleted_at, clock, synced_at FROM tombstones WHERE id = ?",
            params![Tombstone::make_id(table, pk)],
            row_to_tombstone,
        )
        .optional()?)
}

fn row_to_tombstone(row: &Row<'_>) -> rusqlite::Result<Tombstone> {
    Ok(Tombstone {
        id: row.get("id")?,
        table: row.get("table_name")?,
        pk: row.get("pk")?,
        deleted_at: row.get("deleted_at")?,
        clock: row.get::<_, i64>("clock")? as u64,
        synced_at: row.get("synced_at")?,
    })
}

pub fn get_tombstones_bulk(
    conn: &impl ConnExt,
    table: &str,
    pks: &[String],
) -> Result<HashMap<String, Tombstone>> {
    let mut out = HashMap::new();
    if pks.is_empty() {
        return Ok(out);
    }
    let ids: Vec<String> = pks.iter().map(|pk| Tombstone::make_id(table, pk)).collect();
    sql_support::each_chunk(&ids, |chunk, _offset| -> Result<()> {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT id, table_name, pk, deleted_at, clock, synced_at
             FROM tombstones WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.conn().prepare(&sql)?;
        let rows = stmt.query_map(chunk, row_to_tombstone)?;
        for row in rows {
            let t = row?;
            out.insert(t.pk.clone(), t);
        }
        Ok(())
    })?;
    Ok(out)
}

/// Store a tombstone only if no existing tombstone for this key already
/// has a clock at or past `clock` - a late-arriving, already-superseded
/// delete must not resurrect an older `deleted_at`/`synced_at`.
pub fn write_tombstone(
    conn: &impl ConnExt,
    table: &str,
    pk: &str,
    clock: u64,
    deleted_at: i64,
) -> Result<()> {
    let id = Tombstone::make_id(table, pk);
    let existing_clock: Option<i64> = conn
        .conn()
        .query_row(
            "SELECT clock FROM tombstones WHERE id = ?",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(existing) = existing_clock {
        if existing as u64 >= clock {
            return Ok(());
        }
    }
    conn.conn().execute(
        "INSERT INTO tombstones (id, table_name, pk, deleted_at, clock, synced_at)
         VALUES (?, ?, ?, ?, ?, NULL)
         ON CONFLICT(id) DO UPDATE SET deleted_at = excluded.deleted_at, clock = excluded.clock, synced_at = NULL",
        params![id, table, pk, deleted_at, clock as i64],
    )?;
    Ok(())
}

pub fn clear_tombstone(conn: &impl ConnExt, table: &str, pk: &str) -> Result<()> {
    conn.conn().execute(
        "DELETE FROM tombstones WHERE id = ?",
        params![Tombstone::make_id(table, pk)],
    )?;
    Ok(())
}

pub fn mark_tombstone_synced(conn: &impl ConnExt, table: &str, pk: &str, synced_at: i64) -> Result<()> {
    conn.conn().execute(
        "UPDATE tombstones SET synced_at = ? WHERE id = ?",
        params![synced_at, Tombstone::make_id(table, pk)],
    )?;
    Ok(())
}

pub fn get_tombstones_for_gc(conn: &impl ConnExt, cutoff: i64) -> Result<Vec<Tombstone>> {
    let mut stmt = conn.conn().prepare(
        "SELECT id, table_name, pk, deleted_at, clock, synced_at
         FROM tombstones
         WHERE deleted_at <= ? AND synced_at IS NOT NULL AND synced_at <= ?",
    )?;
    let rows = stmt.query_map(params![cutoff, cutoff], row_to_tombstone)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete_tombstones(conn: &impl ConnExt, ids: &[String]) -> Result<()> {
    sql_support::each_chunk(ids, |chunk, _offset| -> Result<()> {
        let placeholders = vec!["?"; chunk.len()].join(",");
        conn.conn().execute(
            &format!("DELETE FROM tombstones WHERE id IN ({placeholders})"),
            chunk,
        )?;
        Ok(())
    })
}

// ---- pending ops ----

fn row_to_pending_op(row: &Row<'_>) -> rusqlite::Result<PendingOp> {
    let op_kind: String = row.get("operation")?;
    let payload_text: Option<String> = row.get("payload")?;
    let operation = if op_kind == "put" {
        let text = payload_text.unwrap_or_else(|| "null".to_string());
        Operation::Put {
            payload: serde_json::from_str(&text).unwrap_or(serde_json::Value::Null),
        }
    } else {
        Operation::Delete
    };
    let status_str: String = row.get("status")?;
    let status = match status_str.as_str() {
        "syncing" => PendingStatus::Syncing,
        "failed" => PendingStatus::Failed,
        _ => PendingStatus::Pending,
    };
    Ok(PendingOp {
        id: Guid::from(row.get::<_, String>("id")?),
        table: row.get("table_name")?,
        pk: row.get("pk")?,
        operation,
        stamp: Stamp {
            device_id: row.get("device_id")?,
            op_id: Guid::from(row.get::<_, String>("op_id")?),
            hlc: row.get("hlc")?,
            clock: row.get::<_, i64>("clock")? as u64,
        },
        created_at: row.get("created_at")?,
        attempts: row.get::<_, i64>("attempts")? as u32,
        status,
        next_attempt_at: row.get("next_attempt_at")?,
    })
}

pub fn insert_pending_op(conn: &impl ConnExt, op: &PendingOp) -> Result<()> {
    let (op_kind, payload) = match &op.operation {
        Operation::Put { payload } => ("put", Some(serde_json::to_string(payload)?)),
        Operation::Delete => ("delete", None),
    };
    conn.conn().execute(
        "INSERT INTO pending_ops
            (id, table_name, pk, operation, payload, device_id, op_id, hlc, clock,
             created_at, attempts, status, next_attempt_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            op.id.as_str(),
            op.table,
            op.pk,
            op_kind,
            payload,
            op.stamp.device_id,
            op.stamp.op_id.as_str(),
            op.stamp.hlc,
            op.stamp.clock as i64,
            op.created_at,
            op.attempts as i64,
            op.status.to_string(),
            op.next_attempt_at,
        ],
    )?;
    Ok(())
}

pub fn delete_pending_op(conn: &impl ConnExt, id: &str) -> Result<()> {
    conn.conn()
        .execute("DELETE FROM pending_ops WHERE id = ?", params![id])?;
    Ok(())
}

pub fn delete_pending_ops(conn: &impl ConnExt, ids: &[String]) -> Result<()> {
    sql_support::each_chunk(ids, |chunk, _offset| -> Result<()> {
        let placeholders = vec!["?"; chunk.len()].join(",");
        conn.conn().execute(
            &format!("DELETE FROM pending_ops WHERE id IN ({placeholders})"),
            chunk,
        )?;
        Ok(())
    })
}

/// The batch the outbox coalesces and pushes: up to `limit` ops with
/// `status = 'pending'` whose backoff (if any) has elapsed, oldest first.
pub fn get_pending_ops(conn: &impl ConnExt, limit: usize, now: i64) -> Result<Vec<PendingOp>> {
    let mut stmt = conn.conn().prepare(
        "SELECT * FROM pending_ops
         WHERE status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
         ORDER BY created_at ASC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![now, limit as i64], row_to_pending_op)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_failed_ops(conn: &impl ConnExt) -> Result<Vec<PendingOp>> {
    let mut stmt = conn
        .conn()
        .prepare("SELECT * FROM pending_ops WHERE status = 'failed' ORDER BY created_at ASC")?;
    let rows = stmt.query_map([], row_to_pending_op)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_pending(conn: &impl ConnExt) -> Result<usize> {
    Ok(conn
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM pending_ops WHERE status = 'pending'",
            [],
            |r| r.get::<_, i64>(0),
        )? as usize)
}

pub fn mark_ops_syncing(conn: &impl ConnExt, ids: &[String]) -> Result<()> {
    sql_support::each_chunk(ids, |chunk, _offset| -> Result<()> {
        let placeholders = vec!["?"; chunk.len()].join(",");
        conn.conn().execute(
            &format!("UPDATE pending_ops SET status = 'syncing' WHERE id IN ({placeholders})"),
            chunk,
        )?;
        Ok(())
    })
}

/// Crash recovery: any op left `syncing` from a prior process becomes
/// `pending` again and is eligible immediately.
pub fn reset_syncing_to_pending(conn: &impl ConnExt, now: i64) -> Result<usize> {
    Ok(conn.conn().execute(
        "UPDATE pending_ops SET status = 'pending', next_attempt_at = ? WHERE status = 'syncing'",
        params![now],
    )?)
}

pub fn purge_failed_ops(conn: &impl ConnExt) -> Result<usize> {
    Ok(conn
        .conn()
        .execute("DELETE FROM pending_ops WHERE status = 'failed'", [])?)
}

pub fn schedule_retry(conn: &impl ConnExt, id: &str, attempts: u32, next_attempt_at: i64) -> Result<()> {
    conn.conn().execute(
        "UPDATE pending_ops SET status = 'pending', attempts = ?, next_attempt_at = ? WHERE id = ?",
        params![attempts as i64, next_attempt_at, id],
    )?;
    Ok(())
}

pub fn mark_op_failed(conn: &impl ConnExt, id: &str, attempts: u32) -> Result<()> {
    conn.conn().execute(
        "UPDATE pending_ops SET status = 'failed', attempts = ?, next_attempt_at = NULL WHERE id = ?",
        params![attempts as i64, id],
    )?;
    Ok(())
}

pub fn retry_failed_ops(conn: &impl ConnExt) -> Result<usize> {
    Ok(conn.conn().execute(
        "UPDATE pending_ops SET status = 'pending', attempts = 0, next_attempt_at = NULL
         WHERE status = 'failed'",
        [],
    )?)
}

// ---- sync state / cursor ----

pub fn get_sync_state(conn: &impl ConnExt, state_id: &str) -> Result<Option<SyncStateRow>> {
    Ok(conn
        .conn()
        .query_row(
            "SELECT id, cursor, last_sync_at, device_id FROM sync_state WHERE id = ?",
            params![state_id],
            |row| {
                Ok(SyncStateRow {
                    id: row.get(0)?,
                    cursor: row.get::<_, i64>(1)? as u64,
                    last_sync_at: row.get(2)?,
                    device_id: row.get(3)?,
                })
            },
        )
        .optional()?)
}

pub fn ensure_sync_state(conn: &impl ConnExt, state_id: &str, device_id: &str) -> Result<SyncStateRow> {
    if let Some(row) = get_sync_state(conn, state_id)? {
        return Ok(row);
    }
    conn.conn().execute(
        "INSERT INTO sync_state (id, cursor, last_sync_at, device_id) VALUES (?, 0, 0, ?)",
        params![state_id, device_id],
    )?;
    Ok(SyncStateRow {
        id: state_id.to_string(),
        cursor: 0,
        last_sync_at: 0,
        device_id: device_id.to_string(),
    })
}

pub fn set_cursor(conn: &impl ConnExt, state_id: &str, cursor: u64) -> Result<()> {
    conn.conn().execute(
        "UPDATE sync_state SET cursor = ? WHERE id = ?",
        params![cursor as i64, state_id],
    )?;
    Ok(())
}

pub fn mark_sync_complete(conn: &impl ConnExt, state_id: &str, now_ms: i64) -> Result<()> {
    conn.conn().execute(
        "UPDATE sync_state SET last_sync_at = ? WHERE id = ?",
        params![now_ms, state_id],
    )?;
    Ok(())
}

pub fn reset_cursor(conn: &impl ConnExt, state_id: &str) -> Result<()> {
    conn.conn().execute(
        "UPDATE sync_state SET cursor = 0, last_sync_at = 0 WHERE id = ?",
        params![state_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::test::new_mem_db;

    #[test]
    fn test_put_and_get_record() {
        let db = new_mem_db();
        db.in_transaction(|tx| {
            put_record(
                tx,
                "messages",
                "m1",
                &RecordMeta {
                    clock: 1,
                    hlc: "h1".into(),
                    deleted: false,
                    deleted_at: None,
                    order_key: Some("h1".into()),
                },
                &serde_json::json!({"text": "hi"}),
            )
        })
        .unwrap();
        db.in_transaction(|tx| {
            let rec = get_record(tx, "messages", "m1").unwrap().unwrap();
            assert_eq!(rec.meta.clock, 1);
            assert_eq!(rec.payload["text"], "hi");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_tombstone_write_policy_rejects_regress() {
        let db = new_mem_db();
        db.in_transaction(|tx| {
            write_tombstone(tx, "messages", "m1", 5, 100)?;
            write_tombstone(tx, "messages", "m1", 3, 200)?; // stale, ignored
            let t = get_tombstone(tx, "messages", "m1")?.unwrap();
            assert_eq!(t.clock, 5);
            assert_eq!(t.deleted_at, 100);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_pending_ops_respect_backoff() {
        let db = new_mem_db();
        db.in_transaction(|tx| {
            insert_pending_op(
                tx,
                &PendingOp {
                    id: Guid::from("op1"),
                    table: "threads".into(),
                    pk: "t1".into(),
                    operation: Operation::Delete,
                    stamp: Stamp {
                        device_id: "d".into(),
                        op_id: Guid::from("op1"),
                        hlc: "h".into(),
                        clock: 1,
                    },
                    created_at: 0,
                    attempts: 0,
                    status: PendingStatus::Pending,
                    next_attempt_at: None,
                },
            )?;
            schedule_retry(tx, "op1", 1, 5_000)?;
            assert!(get_pending_ops(tx, 10, 1_000)?.is_empty());
            assert_eq!(get_pending_ops(tx, 10, 5_000)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_cursor_roundtrip() {
        let db = new_mem_db();
        db.in_transaction(|tx| {
            ensure_sync_state(tx, "sync_state:ws1", "dev00001")?;
            set_cursor(tx, "sync_state:ws1", 42)?;
            let row = get_sync_state(tx, "sync_state:ws1")?.unwrap();
            assert_eq!(row.cursor, 42);
            Ok(())
        })
        .unwrap();
    }
}
