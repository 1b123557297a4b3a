//! Raw epoch gap detection
//!
//! Aggregation never merges across a hole in the raw epoch table. A pass
//! asks its gap source for the missing epochs of the range it is about to
//! consume and refuses to touch anything when the answer is non-empty.

use rusqlite::{params, Connection};

use super::error::{Result, RollupError, StoreContext};
use super::schema::EPOCH_TABLE;
use super::types::EpochRange;

/// Reports which epochs of a range have no raw rows at all
pub trait EpochGapSource {
    /// Missing epochs of `range` collapsed into contiguous ranges, ascending
    fn epoch_gaps_between(&self, range: EpochRange) -> Result<Vec<EpochRange>>;
}

impl EpochGapSource for Connection {
    fn epoch_gaps_between(&self, range: EpochRange) -> Result<Vec<EpochRange>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "WITH RECURSIVE wanted(epoch) AS (
                SELECT ?1
                UNION ALL
                SELECT epoch + 1 FROM wanted WHERE epoch + 1 < ?2
            )
            SELECT epoch FROM wanted
            WHERE NOT EXISTS (SELECT 1 FROM {} e WHERE e.epoch = wanted.epoch)
            ORDER BY epoch",
            EPOCH_TABLE
        );

        let mut stmt = self
            .prepare(&sql)
            .context("failed to prepare gap query")?;
        let rows = stmt
            .query_map(params![range.from, range.to], |row| row.get::<_, u64>(0))
            .with_context(|| format!("failed to query gaps in {}", range))?;

        let mut missing = Vec::new();
        for epoch in rows {
            missing.push(epoch.with_context(|| format!("failed to read gap row in {}", range))?);
        }
        Ok(EpochRange::collapse(&missing))
    }
}

/// Fail with [`RollupError::Gap`] if `range` is not fully present upstream
pub fn ensure_no_gaps<S: EpochGapSource + ?Sized>(source: &S, range: EpochRange) -> Result<()> {
    let gaps = source.epoch_gaps_between(range)?;
    if gaps.is_empty() {
        return Ok(());
    }

    log::warn!("⚠️  Refusing to aggregate {}: missing epochs {:?}", range, gaps);
    Err(RollupError::Gap {
        from: range.from,
        to: range.to,
        gaps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::schema::ensure_schema;
    use crate::rollup::testutil::insert_epoch;

    struct FixedGaps(Vec<u64>);

    impl EpochGapSource for FixedGaps {
        fn epoch_gaps_between(&self, range: EpochRange) -> Result<Vec<EpochRange>> {
            let missing: Vec<u64> = self.0.iter().copied().filter(|e| range.contains(*e)).collect();
            Ok(EpochRange::collapse(&missing))
        }
    }

    #[test]
    fn test_gap_refusal_names_missing_ranges() {
        let source = FixedGaps(vec![5, 8, 9]);
        let err = ensure_no_gaps(&source, EpochRange::new(0, 10)).unwrap_err();
        match err {
            RollupError::Gap { from, to, gaps } => {
                assert_eq!((from, to), (0, 10));
                assert_eq!(gaps, vec![EpochRange::new(5, 6), EpochRange::new(8, 10)]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(ensure_no_gaps(&source, EpochRange::new(0, 5)).is_ok());
    }

    #[test]
    fn test_connection_reports_missing_epochs() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        for epoch in (0..10).filter(|e| *e != 5) {
            insert_epoch(&conn, epoch, 1, 1);
            insert_epoch(&conn, epoch, 2, 1);
        }

        assert_eq!(
            conn.epoch_gaps_between(EpochRange::new(0, 10)).unwrap(),
            vec![EpochRange::new(5, 6)]
        );
        assert_eq!(
            conn.epoch_gaps_between(EpochRange::new(8, 12)).unwrap(),
            vec![EpochRange::new(10, 12)]
        );
        assert!(conn.epoch_gaps_between(EpochRange::new(6, 6)).unwrap().is_empty());
    }
}
