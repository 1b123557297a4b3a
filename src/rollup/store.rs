//! Queries against the raw epoch table and bucket tables, plus the write
//! transaction every pass commits through

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::error::{Result, StoreContext};
use super::schema::EPOCH_TABLE;
use super::types::ExportedBucket;

/// Most recent bucket of `table`: highest `epoch_start`, and the furthest
/// `epoch_end` any validator row in it reached.
pub fn last_exported_bucket(conn: &Connection, table: &str) -> Result<Option<ExportedBucket>> {
    let sql = format!(
        "SELECT epoch_start, epoch_end FROM {} ORDER BY epoch_start DESC, epoch_end DESC LIMIT 1",
        table
    );
    conn.query_row(&sql, [], |row| {
        Ok(ExportedBucket {
            epoch_start: row.get(0)?,
            epoch_end: row.get(1)?,
        })
    })
    .optional()
    .with_context(|| format!("failed to read last exported bucket of {}", table))
}

pub fn earliest_exported_epoch(conn: &Connection) -> Result<Option<u64>> {
    let sql = format!("SELECT MIN(epoch) FROM {}", EPOCH_TABLE);
    conn.query_row(&sql, [], |row| row.get(0))
        .context("failed to read earliest exported epoch")
}

pub fn latest_exported_epoch(conn: &Connection) -> Result<Option<u64>> {
    let sql = format!("SELECT MAX(epoch) FROM {}", EPOCH_TABLE);
    conn.query_row(&sql, [], |row| row.get(0))
        .context("failed to read latest exported epoch")
}

/// Begin a write transaction that takes the database write lock up front.
/// Hour and day passes write through separate connections; waiting for the
/// lock goes through the busy timeout instead of failing a read-to-write
/// upgrade with `SQLITE_BUSY`.
pub fn begin_write<F>(conn: &mut Connection, context: F) -> Result<Transaction<'_>>
where
    F: FnOnce() -> String,
{
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .with_context(context)
}
