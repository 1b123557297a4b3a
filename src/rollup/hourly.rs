//! Epoch → hour rollup
//!
//! Owns the hourly bucket table, its epoch-numbered partitions, and the
//! trailing 1h window. Every operation holds the hour lock for its whole
//! duration.

use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};

use super::bounds::ChainSpec;
use super::error::{Result, RollupError, StoreContext};
use super::merge::{MergeTarget, SourceTable};
use super::partition::{Partition, PartitionManager, PartitionScheme};
use super::rolling::{HourlyRollingPolicy, RollingAggregator};
use super::schema::{TableLayout, HOURLY_TABLE};
use super::store::{begin_write, last_exported_bucket, latest_exported_epoch};
use super::types::{AggregationOutcome, EpochRange, ExportedBucket, Granularity};
use super::walk::{advance, BucketGrid};
use crate::config::RollupConfig;

struct HourGrid {
    chain: ChainSpec,
}

impl BucketGrid for HourGrid {
    fn granularity(&self) -> Granularity {
        Granularity::Hour
    }

    fn table(&self) -> &'static str {
        HOURLY_TABLE
    }

    fn source(&self) -> SourceTable {
        SourceTable::Epochs
    }

    fn bucket_bounds(&self, epoch: u64) -> EpochRange {
        self.chain.hour_bounds(epoch)
    }

    fn merge_target(&self, partition: Partition, _bucket: EpochRange) -> MergeTarget {
        MergeTarget::hourly(partition.name)
    }
}

pub struct EpochToHourAggregator {
    conn: Mutex<Connection>,
    grid: HourGrid,
    partitions: PartitionManager,
    rolling: RollingAggregator<HourlyRollingPolicy>,
    catchup_limit: Option<u64>,
}

impl EpochToHourAggregator {
    pub fn new(conn: Connection, config: &RollupConfig) -> Result<Self> {
        config.validate()?;
        let chain = config.chain;
        let partitions = PartitionManager::new(
            HOURLY_TABLE,
            TableLayout::Hourly,
            PartitionScheme::Epochs {
                width_in_hours: config.hour_partition_width,
            },
            chain,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            grid: HourGrid { chain },
            partitions,
            rolling: RollingAggregator::new(HourlyRollingPolicy::new(chain)),
            catchup_limit: config.hour_catchup_limit,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RollupError::LockPoisoned {
            granularity: Granularity::Hour,
        })
    }

    /// Roll every raw epoch up to and including `current_epoch` into hour
    /// buckets, then move the 1h window to end there.
    pub fn aggregate(&self, current_epoch: u64) -> Result<AggregationOutcome> {
        let mut conn = self.lock()?;

        let mut outcome = advance(
            &mut conn,
            &self.grid,
            &self.partitions,
            current_epoch,
            self.catchup_limit,
        )?;
        if outcome.behind_by.is_some() || last_exported_bucket(&conn, HOURLY_TABLE)?.is_none() {
            return Ok(outcome);
        }

        let rolling = self.rolling.aggregate(&mut conn, current_epoch)?;
        outcome.rolling_window = Some(rolling.window());
        Ok(outcome)
    }

    /// Drop hourly partitions lying entirely below `below_epoch`
    pub fn clear_old_hour_aggregations(&self, below_epoch: u64) -> Result<Vec<Partition>> {
        let mut conn = self.lock()?;
        let tx = begin_write(&mut conn, || "failed to begin hourly retention".to_string())?;
        let dropped = self.partitions.drop_partitions_below(&tx, below_epoch)?;
        tx.commit()
            .with_context(|| format!("failed to commit hourly retention below {}", below_epoch))?;

        if !dropped.is_empty() {
            log::info!(
                "🧹 Hourly retention: dropped {} partition(s) below epoch {}",
                dropped.len(),
                below_epoch
            );
        }
        Ok(dropped)
    }

    pub fn last_exported(&self) -> Result<Option<ExportedBucket>> {
        let conn = self.lock()?;
        last_exported_bucket(&conn, HOURLY_TABLE)
    }

    pub fn latest_exported_epoch(&self) -> Result<Option<u64>> {
        let conn = self.lock()?;
        latest_exported_epoch(&conn)
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
