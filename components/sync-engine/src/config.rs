//! External interfaces (section 6): the fixed synced-table set, per-table pk
//! field names, and the kv capture blocklist. Hosts extend these through
//! `EngineConfig` rather than editing the engine.

use std::collections::HashSet;

/// One of the fixed synced tables, plus whatever a host extends the set
/// with. `pk_field` documents which payload field is the primary key
/// (`id` for most tables, `hash` for `file_meta`) - purely informational
/// for the engine, since payloads are opaque, but callers constructing a
/// `WriteCaptureBridge` call rely on it to find the host's pk value.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub pk_field: String,
    /// True only for `messages`: a missing `order_key` is derived from
    /// the write's HLC (section 4.4).
    pub needs_order_key: bool,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, pk_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pk_field: pk_field.into(),
            needs_order_key: false,
        }
    }

    pub fn messages() -> Self {
        Self {
            name: "messages".into(),
            pk_field: "id".into(),
            needs_order_key: true,
        }
    }
}

/// Per-scope, per-engine configuration: which tables are synced, and which
/// `kv` sub-keys are never captured (session tokens, model catalogs, pure
/// caches - section 6). Hosts extend the blocklist via `block_kv`.
pub struct EngineConfig {
    pub tables: Vec<TableSchema>,
    kv_blocklist: HashSet<String>,
    pub flush_interval_ms: u64,
    pub max_batch_size: usize,
    pub retry_delays_ms: Vec<u64>,
    pub max_pending_ops_warning: usize,
    pub gc_interval_ms: u64,
    pub gc_retention_seconds: i64,
    pub cursor_max_age_ms: i64,
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tables: vec![
                TableSchema::new("threads", "id"),
                TableSchema::messages(),
                TableSchema::new("projects", "id"),
                TableSchema::new("posts", "id"),
                TableSchema::new("kv", "name"),
                TableSchema::new("file_meta", "hash"),
            ],
            kv_blocklist: HashSet::new(),
            flush_interval_ms: 1_000,
            max_batch_size: 50,
            retry_delays_ms: vec![250, 1_000, 3_000, 5_000],
            max_pending_ops_warning: 500,
            gc_interval_ms: 10 * 60 * 1_000,
            gc_retention_seconds: 30 * 24 * 60 * 60,
            cursor_max_age_ms: 24 * 60 * 60 * 1_000,
            poll_interval_ms: 2_000,
        }
    }
}

impl EngineConfig {
    pub fn block_kv(&mut self, name: impl Into<String>) -> &mut Self {
        self.kv_blocklist.insert(name.into());
        self
    }

    pub fn is_kv_blocked(&self, name: &str) -> bool {
        self.kv_blocklist.contains(name)
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn is_synced_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn add_table(&mut self, schema: TableSchema) -> &mut Self {
        self.tables.push(schema);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables() {
        let cfg = EngineConfig::default();
        assert!(cfg.is_synced_table("messages"));
        assert!(!cfg.is_synced_table("not_a_table"));
        assert_eq!(cfg.table("file_meta").unwrap().pk_field, "hash");
        assert!(cfg.table("messages").unwrap().needs_order_key);
    }

    #[test]
    fn test_kv_blocklist() {
        let mut cfg = EngineConfig::default();
        assert!(!cfg.is_kv_blocked("session_token"));
        cfg.block_kv("session_token");
        assert!(cfg.is_kv_blocked("session_token"));
    }
}
