//! Hour → UTC day rollup
//!
//! Day buckets start on UTC midnights. They are summed from hour buckets
//! where those are complete, with raw epochs covering any hour still open,
//! and land in date-named partitions. The trailing 24h window is advanced
//! under the same lock.

use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};

use super::bounds::ChainSpec;
use super::error::{Result, RollupError};
use super::merge::{MergeTarget, SourceTable};
use super::partition::{Partition, PartitionManager, PartitionScheme};
use super::rolling::{DailyRollingPolicy, RollingAggregator};
use super::schema::{TableLayout, DAILY_TABLE};
use super::store::last_exported_bucket;
use super::types::{AggregationOutcome, EpochRange, ExportedBucket, Granularity};
use super::walk::{advance, BucketGrid};
use crate::config::RollupConfig;

const DAY_LABEL_FORMAT: &str = "%Y-%m-%d";

struct DayGrid {
    chain: ChainSpec,
}

impl BucketGrid for DayGrid {
    fn granularity(&self) -> Granularity {
        Granularity::Day
    }

    fn table(&self) -> &'static str {
        DAILY_TABLE
    }

    fn source(&self) -> SourceTable {
        SourceTable::HourBuckets
    }

    fn bucket_bounds(&self, epoch: u64) -> EpochRange {
        self.chain.day_bounds(epoch)
    }

    fn merge_target(&self, partition: Partition, bucket: EpochRange) -> MergeTarget {
        let day = self.chain.epoch_to_day(bucket.from).format(DAY_LABEL_FORMAT);
        MergeTarget::daily(partition.name, day.to_string())
    }
}

pub struct HourToDayAggregator {
    conn: Mutex<Connection>,
    grid: DayGrid,
    partitions: PartitionManager,
    rolling: RollingAggregator<DailyRollingPolicy>,
}

impl HourToDayAggregator {
    pub fn new(conn: Connection, config: &RollupConfig) -> Result<Self> {
        config.validate()?;
        let chain = config.chain;
        let partitions = PartitionManager::new(
            DAILY_TABLE,
            TableLayout::Daily,
            PartitionScheme::Days {
                width_in_days: config.day_partition_width,
            },
            chain,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            grid: DayGrid { chain },
            partitions,
            rolling: RollingAggregator::new(DailyRollingPolicy::new(chain)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RollupError::LockPoisoned {
            granularity: Granularity::Day,
        })
    }

    /// Roll everything up to and including `current_epoch` into day buckets,
    /// then move the 24h window to end there.
    pub fn aggregate(&self, current_epoch: u64) -> Result<AggregationOutcome> {
        let mut conn = self.lock()?;

        let mut outcome = advance(&mut conn, &self.grid, &self.partitions, current_epoch, None)?;
        if last_exported_bucket(&conn, DAILY_TABLE)?.is_none() {
            return Ok(outcome);
        }

        let rolling = self.rolling.aggregate(&mut conn, current_epoch)?;
        outcome.rolling_window = Some(rolling.window());
        Ok(outcome)
    }

    /// Raw epochs the 24h window ending at `head_epoch` still needs at its tail
    pub fn missing_rolling_24h_tail_epochs(&self, head_epoch: u64) -> Result<Vec<EpochRange>> {
        let conn = self.lock()?;
        self.rolling.missing_tail_epochs(&conn, head_epoch)
    }

    pub fn last_exported(&self) -> Result<Option<ExportedBucket>> {
        let conn = self.lock()?;
        last_exported_bucket(&conn, DAILY_TABLE)
    }

    pub fn rolling_window(&self) -> Result<Option<EpochRange>> {
        let conn = self.lock()?;
        self.rolling.window(&conn)
    }

    pub fn partitions(&self) -> Result<Vec<Partition>> {
        let conn = self.lock()?;
        self.partitions.list_partitions(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::hourly::EpochToHourAggregator;
    use crate::rollup::schema::{ensure_schema, ROLLING_24H_TABLE};
    use crate::rollup::testutil::insert_epochs;
    use tempfile::tempdir;

    fn config() -> RollupConfig {
        RollupConfig::new(ChainSpec::new(1_600_041_600, 900))
    }

    fn open(path: &std::path::Path) -> Connection {
        let conn = crate::sqlite_pragma::open_connection(path).unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn day_rows(conn: &Connection) -> Vec<(String, u64, u64, i64)> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT day, epoch_start, epoch_end, attestations_reward FROM {}
                 WHERE validator_index = 1 ORDER BY epoch_start",
                DAILY_TABLE
            ))
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_days_align_to_utc_dates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daily.db");
        let writer = open(&path);
        insert_epochs(&writer, 0, 200, &[1, 2], 1);

        let hours = EpochToHourAggregator::new(open(&path), &config()).unwrap();
        let days = HourToDayAggregator::new(open(&path), &config()).unwrap();
        hours.aggregate(150).unwrap();
        days.aggregate(150).unwrap();
        hours.aggregate(199).unwrap();
        let outcome = days.aggregate(199).unwrap();
        assert_eq!(outcome.merged, vec![EpochRange::new(151, 192), EpochRange::new(192, 200)]);
        assert_eq!(outcome.rolling_window, Some(EpochRange::new(104, 200)));

        assert_eq!(
            day_rows(&writer),
            vec![
                ("2020-09-14".to_string(), 0, 96, 96),
                ("2020-09-15".to_string(), 96, 192, 96),
                ("2020-09-16".to_string(), 192, 200, 8),
            ]
        );

        let window_reward: i64 = writer
            .query_row(
                &format!(
                    "SELECT attestations_reward FROM {} WHERE validator_index = 2",
                    ROLLING_24H_TABLE
                ),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(window_reward, 96);

        let partitions = days.partitions().unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].range, EpochRange::new(0, 576));
    }

    #[test]
    fn test_window_needs_rolled_up_hours() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daily.db");
        let writer = open(&path);
        insert_epochs(&writer, 0, 40, &[1], 1);

        let days = HourToDayAggregator::new(open(&path), &config()).unwrap();
        let err = days.aggregate(39).unwrap_err();
        assert!(matches!(err, RollupError::BootstrapPrereq { epoch: 0, .. }));

        // day buckets were committed before the window failed
        assert_eq!(
            days.last_exported().unwrap(),
            Some(ExportedBucket {
                epoch_start: 0,
                epoch_end: 40
            })
        );
        assert_eq!(days.rolling_window().unwrap(), None);

        let hours = EpochToHourAggregator::new(open(&path), &config()).unwrap();
        hours.aggregate(39).unwrap();
        let outcome = days.aggregate(39).unwrap();
        assert!(outcome.merged.is_empty());
        assert_eq!(outcome.rolling_window, Some(EpochRange::new(0, 40)));
    }
}
