//! Hierarchical epoch → hour → day rollup engine
//!
//! Raw per-epoch validator rows are rolled up incrementally into hour
//! buckets, hour buckets into UTC-day buckets, and two trailing windows
//! (1h and 24h) are kept current. Bucket tables are partitioned by time
//! range; old hourly partitions are dropped by a retention sweep.
//!
//! Each granularity serializes its own passes; hour and day passes can run
//! at the same time on their own connections.

pub mod bounds;
pub mod daily;
pub mod error;
pub mod gaps;
pub mod hourly;
pub mod merge;
pub mod partition;
pub mod rolling;
pub mod schema;
pub mod store;
pub mod types;
pub mod walk;

#[cfg(test)]
pub(crate) mod testutil;

pub use bounds::{bucket_bounds, partition_range, ChainSpec};
pub use daily::HourToDayAggregator;
pub use error::{Result, RollupError};
pub use gaps::{ensure_no_gaps, EpochGapSource};
pub use hourly::EpochToHourAggregator;
pub use partition::Partition;
pub use rolling::{RollingOutcome, RollingPolicy};
pub use types::{AggregationOutcome, EpochRange, ExportedBucket, Granularity};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::RollupConfig;
use crate::sqlite_pragma::open_connection;
use error::StoreContext;

/// Both aggregators over one database, each on its own connection
pub struct DashboardRollup {
    hourly: EpochToHourAggregator,
    daily: HourToDayAggregator,
    chain: ChainSpec,
}

impl DashboardRollup {
    /// Open the database at `config.db_path`, creating the schema if needed.
    /// Fails before touching the database when `config` does not validate.
    pub fn open(config: &RollupConfig) -> Result<Self> {
        config.validate()?;
        let hour_conn = open_connection(&config.db_path)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?;
        schema::ensure_schema(&hour_conn)?;
        let day_conn = open_connection(&config.db_path)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?;

        Ok(Self {
            hourly: EpochToHourAggregator::new(hour_conn, config)?,
            daily: HourToDayAggregator::new(day_conn, config)?,
            chain: config.chain,
        })
    }

    pub fn hourly(&self) -> &EpochToHourAggregator {
        &self.hourly
    }

    pub fn daily(&self) -> &HourToDayAggregator {
        &self.daily
    }

    /// Newest epoch present in the raw table
    pub fn latest_exported_epoch(&self) -> Result<Option<u64>> {
        self.hourly.latest_exported_epoch()
    }

    pub fn aggregate_hour(&self, current_epoch: u64) -> Result<AggregationOutcome> {
        self.hourly.aggregate(current_epoch)
    }

    pub fn aggregate_day(&self, current_epoch: u64) -> Result<AggregationOutcome> {
        self.daily.aggregate(current_epoch)
    }

    pub fn clear_old_hour_aggregations(&self, below_epoch: u64) -> Result<Vec<Partition>> {
        self.hourly.clear_old_hour_aggregations(below_epoch)
    }

    pub fn missing_rolling_24h_tail_epochs(&self, head_epoch: u64) -> Result<Vec<EpochRange>> {
        self.daily.missing_rolling_24h_tail_epochs(head_epoch)
    }

    pub fn status(&self) -> Result<RollupStatus> {
        let last_hour = self.hourly.last_exported()?;
        Ok(RollupStatus {
            generated_at: Utc::now(),
            last_hour_bucket: last_hour,
            last_day_bucket: self.daily.last_exported()?,
            rolling_1h: self.hourly.rolling_window()?,
            rolling_24h: self.daily.rolling_window()?,
            hourly_partitions: self.hourly.partitions()?,
            daily_partitions: self.daily.partitions()?,
            head_time: last_hour
                .and_then(|b| b.epoch_end.checked_sub(1))
                .map(|epoch| self.chain.epoch_to_time(epoch)),
        })
    }
}

/// Point-in-time snapshot of the rollup tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupStatus {
    pub generated_at: DateTime<Utc>,
    pub last_hour_bucket: Option<ExportedBucket>,
    pub last_day_bucket: Option<ExportedBucket>,
    pub rolling_1h: Option<EpochRange>,
    pub rolling_24h: Option<EpochRange>,
    pub hourly_partitions: Vec<Partition>,
    pub daily_partitions: Vec<Partition>,
    /// Wall-clock time of the last epoch rolled into hours
    pub head_time: Option<DateTime<Utc>>,
}

impl RollupStatus {
    /// Write the snapshot as pretty JSON
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        log::debug!("Saved rollup status to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
