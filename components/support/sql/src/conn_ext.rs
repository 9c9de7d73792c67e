use rusqlite::{
    self, types::ToSql, Connection, Result as SqlResult, Row, Savepoint, Transaction,
    TransactionBehavior,
};
use std::ops::Deref;
use std::time::Instant;

/// Lets us call these helpers on `rusqlite::{Transaction, Connection}`.
/// You must `use ConnExt` to get these methods.
pub trait ConnExt {
    fn conn(&self) -> &Connection;

    fn execute_all(&self, stmts: &[&str]) -> SqlResult<()> {
        let conn = self.conn();
        for sql in stmts {
            conn.execute(sql, [])?;
        }
        Ok(())
    }

    fn execute_cached(&self, sql: &str, params: &[&dyn ToSql]) -> SqlResult<usize> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.execute(params)
    }

    fn query_one<T: rusqlite::types::FromSql>(&self, sql: &str) -> SqlResult<T> {
        self.conn().query_row(sql, [], |row| row.get(0))
    }

    /// Like `query_row`, but returns `None` rather than erroring when no
    /// row matches.
    fn try_query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], mapper: F) -> SqlResult<Option<T>>
    where
        Self: Sized,
        F: FnOnce(&Row<'_>) -> SqlResult<T>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(mapper(row)?)),
        }
    }

    fn unchecked_transaction(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Deferred)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Transaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Savepoint<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

/// rusqlite wants `&mut Connection` to start a transaction, which is
/// inconvenient when a `&Connection` is shared across components. This
/// offers the same guarantees modulo enforcement: nesting isn't checked,
/// but unlike a raw `BEGIN`/`COMMIT` pair, dropping it without a commit
/// rolls back.
pub struct UncheckedTransaction<'conn> {
    conn: &'conn Connection,
    started_at: Instant,
    finished: bool,
}

impl<'conn> UncheckedTransaction<'conn> {
    pub fn new(conn: &'conn Connection, behavior: TransactionBehavior) -> SqlResult<Self> {
        let query = match behavior {
            TransactionBehavior::Deferred => "BEGIN DEFERRED",
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
            _ => "BEGIN DEFERRED",
        };
        conn.execute_batch(query)?;
        Ok(UncheckedTransaction {
            conn,
            started_at: Instant::now(),
            finished: false,
        })
    }

    pub fn commit(mut self) -> SqlResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        log::trace!("transaction committed after {:?}", self.started_at.elapsed());
        Ok(())
    }

    pub fn rollback(mut self) -> SqlResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }
}

impl Deref for UncheckedTransaction<'_> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for UncheckedTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                log::warn!("error rolling back unfinished transaction: {}", e);
            }
        }
    }
}

impl ConnExt for UncheckedTransaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self.conn
    }
}
