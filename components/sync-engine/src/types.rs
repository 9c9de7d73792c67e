//! The wire and storage data model (section 3 of the design): scopes, stamps,
//! pending ops, tombstones, sync state and the change envelope used by the
//! pull/push contracts.

use serde::{Deserialize, Serialize};
use sync_guid::Guid;

/// Identifies an independent sync domain. Two scopes never interact: a
/// cursor, an outbox and a recent-op window each live per-scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub workspace_id: String,
    pub project_id: Option<String>,
}

impl Scope {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            project_id: None,
        }
    }

    pub fn with_project(workspace_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            project_id: Some(project_id.into()),
        }
    }

    /// The `sync_state` row id for this scope, e.g. `sync_state:ws:proj`.
    pub fn state_id(&self) -> String {
        match &self.project_id {
            Some(p) => format!("sync_state:{}:{}", self.workspace_id, p),
            None => format!("sync_state:{}", self.workspace_id),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.project_id {
            Some(p) => write!(f, "{}:{}", self.workspace_id, p),
            None => write!(f, "{}", self.workspace_id),
        }
    }
}

/// The sync stamp every captured write and every wire change carries:
/// who wrote it, with what op id, at what logical time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub device_id: String,
    pub op_id: Guid,
    pub hlc: String,
    pub clock: u64,
}

/// A local row's sync metadata, as stored alongside its application
/// payload. The primary-key field name itself is a property of the table
/// (`TableSchema::pk_field`), so it isn't represented here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub clock: u64,
    pub hlc: String,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_key: Option<String>,
}

/// A fully materialized local record: its table-scoped primary key, sync
/// metadata and opaque application payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub table: String,
    pub pk: String,
    pub meta: RecordMeta,
    pub payload: serde_json::Value,
}

/// What a write or a wire change does to a record. Modeling this as a sum
/// type (rather than a `PendingOp::operation: String` with a separate
/// `payload: Option<...>`) makes "put with no payload" and "delete with a
/// payload" unrepresentable, which is exactly the invariant section 3 calls out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Put { payload: serde_json::Value },
    Delete,
}

impl Operation {
    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        match self {
            Operation::Put { payload } => Some(payload),
            Operation::Delete => None,
        }
    }
}

/// A durable record of a local write awaiting delivery to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOp {
    pub id: Guid,
    pub table: String,
    pub pk: String,
    pub operation: Operation,
    pub stamp: Stamp,
    pub created_at: i64,
    pub attempts: u32,
    pub status: PendingStatus,
    pub next_attempt_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Syncing,
    Failed,
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Syncing => "syncing",
            PendingStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A durable marker that `(table, pk)` was deleted, preventing resurrection
/// by a stale put and letting a late delete win over an earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String, // "table:pk"
    pub table: String,
    pub pk: String,
    pub deleted_at: i64,
    pub clock: u64,
    pub synced_at: Option<i64>,
}

impl Tombstone {
    pub fn make_id(table: &str, pk: &str) -> String {
        format!("{table}:{pk}")
    }
}

/// Per-scope sync bookkeeping: the highest server version applied, and
/// when we last completed a sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStateRow {
    pub id: String,
    pub cursor: u64,
    pub last_sync_at: i64,
    pub device_id: String,
}

/// A change as it travels over the wire, either pulled or delivered via
/// push subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChange {
    pub server_version: u64,
    pub table: String,
    pub pk: String,
    #[serde(flatten)]
    pub operation: Operation,
    pub stamp: Stamp,
}

/// Outcome of applying a batch of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

/// Who won a clock/HLC tie-break, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct ConflictDescriptor {
    pub table: String,
    pub pk: String,
    pub winner: ConflictWinner,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_state_id() {
        let s = Scope::new("ws1");
        assert_eq!(s.state_id(), "sync_state:ws1");
        let s2 = Scope::with_project("ws1", "proj1");
        assert_eq!(s2.state_id(), "sync_state:ws1:proj1");
    }

    #[test]
    fn test_tombstone_id() {
        assert_eq!(Tombstone::make_id("messages", "m1"), "messages:m1");
    }

    #[test]
    fn test_operation_serde_tagging() {
        let op = Operation::Put {
            payload: serde_json::json!({"a": 1}),
        };
        let s = serde_json::to_string(&op).unwrap();
        assert!(s.contains("\"op\":\"put\""));
        let back: Operation = serde_json::from_str(&s).unwrap();
        assert_eq!(back, op);

        let del = Operation::Delete;
        let s = serde_json::to_string(&del).unwrap();
        assert_eq!(s, "{\"op\":\"delete\"}");
    }
}
