//! The local document store's concrete schema. section 3/section 6 specify the
//! transactional and indexed-query contract these tables must satisfy;
//! the physical layout itself is a host concern, but something concrete
//! has to exist for the rest of the engine to run against, so this picks
//! the simplest shape that satisfies that contract: one generic `records`
//! table keyed by `(table_name, pk)` standing in for the host's per-table
//! application rows, plus the engine's own bookkeeping tables.

use rusqlite::Connection;

pub const VERSION: i64 = 1;

const CREATE_RECORDS: &str = "
CREATE TABLE IF NOT EXISTS records (
    table_name  TEXT NOT NULL,
    pk          TEXT NOT NULL,
    payload     TEXT NOT NULL,
    clock       INTEGER NOT NULL,
    hlc         TEXT NOT NULL,
    deleted     INTEGER NOT NULL DEFAULT 0,
    deleted_at  INTEGER,
    order_key   TEXT,
    PRIMARY KEY (table_name, pk)
)";

const CREATE_PENDING_OPS: &str = "
CREATE TABLE IF NOT EXISTS pending_ops (
    id               TEXT PRIMARY KEY,
    table_name       TEXT NOT NULL,
    pk               TEXT NOT NULL,
    operation        TEXT NOT NULL,
    payload          TEXT,
    device_id        TEXT NOT NULL,
    op_id            TEXT NOT NULL,
    hlc              TEXT NOT NULL,
    clock            INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'pending',
    next_attempt_at  INTEGER
)";

const CREATE_PENDING_OPS_INDICES: &str = "
CREATE INDEX IF NOT EXISTS idx_pending_ops_status ON pending_ops(status, next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_pending_ops_created_at ON pending_ops(created_at);
CREATE INDEX IF NOT EXISTS idx_pending_ops_table_pk ON pending_ops(table_name, pk);
";

const CREATE_TOMBSTONES: &str = "
CREATE TABLE IF NOT EXISTS tombstones (
    id          TEXT PRIMARY KEY,
    table_name  TEXT NOT NULL,
    pk          TEXT NOT NULL,
    deleted_at  INTEGER NOT NULL,
    clock       INTEGER NOT NULL,
    synced_at   INTEGER
)";

const CREATE_TOMBSTONES_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tombstones_deleted_at ON tombstones(deleted_at)";

const CREATE_SYNC_STATE: &str = "
CREATE TABLE IF NOT EXISTS sync_state (
    id            TEXT PRIMARY KEY,
    cursor        INTEGER NOT NULL DEFAULT 0,
    last_sync_at  INTEGER NOT NULL DEFAULT 0,
    device_id     TEXT NOT NULL
)";

const CREATE_DEVICE_META: &str = "
CREATE TABLE IF NOT EXISTS device_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    if current == 0 {
        conn.execute_batch(&format!(
            "{CREATE_RECORDS};
             {CREATE_PENDING_OPS};
             {CREATE_PENDING_OPS_INDICES}
             {CREATE_TOMBSTONES};
             {CREATE_TOMBSTONES_INDEX};
             {CREATE_SYNC_STATE};
             {CREATE_DEVICE_META};
             PRAGMA user_version = {VERSION};"
        ))?;
    }
    Ok(())
}
