//! Shared SQLite connection tuning
//!
//! Every connection the rollup engine opens (one per granularity) goes through
//! `open_connection`, so readers and writers agree on journal mode and lock
//! waiting behaviour.

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// How long a connection waits on another connection's write lock before
/// failing with `SQLITE_BUSY`. Hour and day passes share one database file.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Apply optimized PRAGMAs (WAL, NORMAL, MEMORY, mmap, cache, autocheckpoint)
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    conn.pragma_update(None, "cache_size", -64_000i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000i64)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

/// Open (creating if needed) the database at `db_path` with the PRAGMAs applied
pub fn open_connection(db_path: impl AsRef<Path>) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    apply_optimized_pragmas(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wal_mode_enabled() {
        let dir = tempdir().unwrap();
        let conn = open_connection(dir.path().join("pragma.db")).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let sync: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sync, 1); // NORMAL
    }
}
