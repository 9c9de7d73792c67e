use rusqlite::{limits::Limit, types::ToSql};

/// `SQLITE_LIMIT_VARIABLE_NUMBER` as read from an in-memory connection, cached.
/// Wrong if some other connection lowers the limit at runtime, which nothing
/// in this codebase does.
pub fn default_max_variable_number() -> usize {
    lazy_static! {
        static ref MAX_VARIABLE_NUMBER: usize = {
            let conn = rusqlite::Connection::open_in_memory()
                .expect("failed to open in-memory connection");
            let limit = conn.limit(Limit::SQLITE_LIMIT_VARIABLE_NUMBER);
            assert!(limit > 0, "illegal SQLITE_LIMIT_VARIABLE_NUMBER: {limit}");
            limit as usize
        };
    }
    *MAX_VARIABLE_NUMBER
}

/// Calls `do_chunk` with slices of `items` no larger than the connection's
/// max bound-parameter count. Used for `WHERE pk IN (...)` batched lookups
/// over an arbitrary number of pending ops / tombstones / pks.
pub fn each_chunk<T, E, F>(items: &[T], do_chunk: F) -> Result<(), E>
where
    T: ToSql,
    F: FnMut(&[&dyn ToSql], usize) -> Result<(), E>,
{
    each_sized_chunk_mapped(items, default_max_variable_number(), |t| t as &dyn ToSql, do_chunk)
}

pub fn each_chunk_mapped<'a, T, E, Mapper, DoChunk>(
    items: &'a [T],
    to_sql: Mapper,
    do_chunk: DoChunk,
) -> Result<(), E>
where
    Mapper: Fn(&'a T) -> &'a dyn ToSql,
    DoChunk: FnMut(&[&dyn ToSql], usize) -> Result<(), E>,
{
    each_sized_chunk_mapped(items, default_max_variable_number(), to_sql, do_chunk)
}

pub fn each_sized_chunk_mapped<'a, T, E, Mapper, DoChunk>(
    items: &'a [T],
    chunk_size: usize,
    to_sql: Mapper,
    mut do_chunk: DoChunk,
) -> Result<(), E>
where
    Mapper: Fn(&'a T) -> &'a dyn ToSql,
    DoChunk: FnMut(&[&dyn ToSql], usize) -> Result<(), E>,
{
    if items.is_empty() {
        return Ok(());
    }
    let chunk_size = chunk_size.max(1);
    for (i, chunk) in items.chunks(chunk_size).enumerate() {
        let mapped: Vec<&dyn ToSql> = chunk.iter().map(&to_sql).collect();
        do_chunk(&mapped, i * chunk_size)?;
    }
    Ok(())
}
