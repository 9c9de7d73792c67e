//! Write-capture bridge (section 4.4): the linchpin of durability. Every synced
//! write lands as `(record, pending-op[, tombstone])` atomically, in
//! whatever transaction the host already opened - this module never opens
//! one of its own.
//!
//! section 4.4 also describes suppressing capture inside "sync-applied"
//! transactions (remote changes being written locally must not be
//! recaptured as new local writes) via a weak-identity set over the
//! transaction handle. In Rust that runtime check is unnecessary: the
//! resolver applies remote changes through its own
//! `store::queries::put_record` / `mark_record_deleted` calls directly and
//! never routes through this bridge, so there is no transaction for which
//! the suppression check could ever return "skip" - the type system keeps
//! the two write paths apart instead of a runtime identity comparison.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::hlc::Hlc;
use crate::store::queries;
use crate::types::{Operation, PendingOp, PendingStatus, RecordMeta, Stamp};
use rusqlite::Transaction;
use sync_guid::Guid;

/// Fields stripped from a payload before it's persisted into a pending op,
/// because they're large, device-local, or otherwise meaningless to
/// replicate. A real host would configure this per table; this is the
/// engine-wide default floor.
const MAX_PAYLOAD_FIELD_BYTES: usize = 64 * 1024;

pub struct WriteCaptureBridge<'a> {
    config: &'a EngineConfig,
    hlc: &'a Hlc,
    sink: &'a dyn EventSink,
}

impl<'a> WriteCaptureBridge<'a> {
    pub fn new(config: &'a EngineConfig, hlc: &'a Hlc, sink: &'a dyn EventSink) -> Self {
        Self { config, hlc, sink }
    }

    /// Capture a `put`. `payload` is the record as the host wants it
    /// stored, including whatever clock value the host's own write path
    /// assigned it.
    pub fn capture_put(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        pk: &str,
        clock: u64,
        mut payload: serde_json::Value,
    ) -> Result<PendingOp> {
        if self.is_blocked(table, pk) {
            // Not an error: the host just wrote a kv entry we were told
            // never to replicate. The blocklist skips *capture* - no
            // pending op, no tombstone, no `OpCaptured` - but the local
            // record still needs to exist, so `get_record` keeps working
            // for blocklisted keys the same as any other.
            let hlc = self.hlc.generate();
            let meta = RecordMeta {
                clock,
                hlc,
                deleted: false,
                deleted_at: None,
                order_key: None,
            };
            queries::put_record(tx, table, pk, &meta, &payload)?;
            return Ok(Self::noop_op(table, pk));
        }
        sanitize_payload(&mut payload, self.config.table(table).map(|t| t.pk_field.as_str()));

        let hlc = self.hlc.generate();
        let order_key = if self.config.table(table).map(|t| t.needs_order_key).unwrap_or(false) {
            payload
                .get("order_key")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| Some(crate::hlc::Hlc::to_order_key(&hlc)))
        } else {
            None
        };

        let meta = RecordMeta {
            clock,
            hlc: hlc.clone(),
            deleted: false,
            deleted_at: None,
            order_key,
        };
        self.checked_write(tx, table, pk, || queries::put_record(tx, table, pk, &meta, &payload))?;

        let op = PendingOp {
            id: Guid::random(),
            table: table.to_string(),
            pk: pk.to_string(),
            operation: Operation::Put { payload },
            stamp: Stamp {
                device_id: self.hlc.device_id().to_string(),
                op_id: Guid::random(),
                hlc,
                clock,
            },
            created_at: now_ms(),
            attempts: 0,
            status: PendingStatus::Pending,
            next_attempt_at: None,
        };
        self.checked_write(tx, table, pk, || queries::insert_pending_op(tx, &op))?;

        self.sink.emit(Event::OpCaptured {
            table: table.to_string(),
            pk: pk.to_string(),
        });
        Ok(op)
    }

    /// Capture a `delete`. The new clock is derived from the existing
    /// local record (`local.clock + 1`), not supplied by the caller -
    /// there's no new payload to carry a clock of its own.
    pub fn capture_delete(&self, tx: &Transaction<'_>, table: &str, pk: &str) -> Result<PendingOp> {
        let existing = queries::get_record(tx, table, pk)?;
        let clock = existing.map(|r| r.meta.clock + 1).unwrap_or(1);
        let hlc = self.hlc.generate();
        let deleted_at = now_sec();

        if self.is_blocked(table, pk) {
            // As with `capture_put`: still reflect the deletion locally,
            // just never hand it to the outbox or write a tombstone for
            // it - there's nothing downstream that needs to reconcile a
            // delete of a key that was never synced in the first place.
            queries::mark_record_deleted(tx, table, pk, clock, &hlc, deleted_at)?;
            return Ok(Self::noop_op(table, pk));
        }

        self.checked_write(tx, table, pk, || {
            queries::mark_record_deleted(tx, table, pk, clock, &hlc, deleted_at)
        })?;
        self.checked_write(tx, table, pk, || {
            queries::write_tombstone(tx, table, pk, clock, deleted_at)
        })?;

        let op = PendingOp {
            id: Guid::random(),
            table: table.to_string(),
            pk: pk.to_string(),
            operation: Operation::Delete,
            stamp: Stamp {
                device_id: self.hlc.device_id().to_string(),
                op_id: Guid::random(),
                hlc,
                clock,
            },
            created_at: now_ms(),
            attempts: 0,
            status: PendingStatus::Pending,
            next_attempt_at: None,
        };
        self.checked_write(tx, table, pk, || queries::insert_pending_op(tx, &op))?;

        self.sink.emit(Event::OpCaptured {
            table: table.to_string(),
            pk: pk.to_string(),
        });
        Ok(op)
    }

    fn is_blocked(&self, table: &str, pk: &str) -> bool {
        table == "kv" && self.config.is_kv_blocked(pk)
    }

    /// Runs a write and turns "the pending-ops/tombstones tables aren't
    /// reachable from this transaction" into a `NonAtomicCapture`
    /// fatal error, so the whole transaction - the user's own record
    /// write included - rolls back with it.
    fn checked_write(
        &self,
        _tx: &Transaction<'_>,
        table: &str,
        pk: &str,
        f: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        f().map_err(|e| {
            if matches!(&e, Error::Store(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("no such table"))
            {
                self.sink.emit(Event::CaptureNonAtomic {
                    table: table.to_string(),
                    pk: pk.to_string(),
                });
                Error::NonAtomicCapture
            } else {
                e
            }
        })
    }

    fn noop_op(table: &str, pk: &str) -> PendingOp {
        PendingOp {
            id: Guid::random(),
            table: table.to_string(),
            pk: pk.to_string(),
            operation: Operation::Delete,
            stamp: Stamp {
                device_id: String::new(),
                op_id: Guid::from(""),
                hlc: String::new(),
                clock: 0,
            },
            created_at: 0,
            attempts: 0,
            status: PendingStatus::Failed,
            next_attempt_at: None,
        }
    }
}

/// Strips fields that shouldn't leave the device: anything under the
/// table's own pk field is left alone (it's identity, not a local
/// artifact), but local-only keys (by convention, prefixed `_local`) and
/// oversized string values are dropped before the payload is durably
/// queued for upload.
fn sanitize_payload(payload: &mut serde_json::Value, _pk_field: Option<&str>) {
    if let serde_json::Value::Object(map) = payload {
        map.retain(|k, v| {
            if k.starts_with("_local") {
                return false;
            }
            if let serde_json::Value::String(s) = v {
                if s.len() > MAX_PAYLOAD_FIELD_BYTES {
                    log::warn!("dropping oversized field {k} ({} bytes) before capture", s.len());
                    return false;
                }
            }
            true
        });
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn now_sec() -> i64 {
    now_ms() / 1000
}
