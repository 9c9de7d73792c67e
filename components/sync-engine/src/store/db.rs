use crate::error::Result;
use crate::hlc::DeviceIdStore;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

use super::schema;

/// The engine's handle on the local embedded store. A thin wrapper over a
/// single `rusqlite::Connection`, mirroring how the rest of the corpus
/// treats its `StorageDb`: one connection per logical store, transactions
/// taken from it as needed, a `Mutex` around it so the type is `Sync`
/// across the background threads the outbox/subscription/gc loops run on.
pub struct SyncDb {
    conn: Mutex<Connection>,
}

impl SyncDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = OFF; PRAGMA journal_mode = WAL;")
            .or_else(|_| conn.execute_batch("PRAGMA foreign_keys = OFF;"))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside a single transaction. This is the one place the
    /// engine opens transactions of its own; `WriteCaptureBridge` is
    /// explicitly the opposite (section 4.4/section 5) - it never starts one, it's
    /// handed the host's.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Access the connection directly for a host write that the capture
    /// bridge should observe - the host opens the transaction, writes its
    /// record, calls the bridge, then commits.
    pub fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }
}

/// `DeviceIdStore` backed by the `device_meta` table, so the stable
/// 8-character device id used in every HLC survives process restarts the
/// same way the cursor and pending ops do.
pub struct SqliteDeviceIdStore<'a> {
    pub db: &'a SyncDb,
}

const DEVICE_ID_KEY: &str = "device_id";

impl DeviceIdStore for SqliteDeviceIdStore<'_> {
    fn get_device_id(&self) -> Option<String> {
        self.db
            .with_connection(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM device_meta WHERE key = ?",
                        [DEVICE_ID_KEY],
                        |r| r.get::<_, String>(0),
                    )
                    .ok())
            })
            .ok()
            .flatten()
    }

    fn set_device_id(&self, id: &str) {
        let _ = self.db.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO device_meta (key, value) VALUES (?, ?)",
                rusqlite::params![DEVICE_ID_KEY, id],
            )?;
            Ok(())
        });
    }
}
