//! Bucket and partition bounds
//!
//! Everything here is pure arithmetic on epoch numbers. Buckets are half-open
//! `[start, end)` ranges aligned in the genesis-offset frame, so a day bucket
//! starts on the first epoch of a UTC day no matter where epoch 0 falls.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::types::EpochRange;

pub const SECONDS_PER_DAY: u64 = 86_400;
pub const HOURS_PER_DAY: u64 = 24;

/// Bucket of `width` epochs containing `epoch`.
///
/// The epoch is shifted by `genesis_offset` before dividing and shifted back
/// afterwards. The first bucket is clamped to start at epoch 0.
pub fn bucket_bounds(epoch: u64, width: u64, genesis_offset: u64) -> (u64, u64) {
    let shifted = epoch + genesis_offset;
    let mut start = shifted / width * width;
    let end = start + width;
    if start < genesis_offset {
        start = genesis_offset;
    }
    (start - genesis_offset, end - genesis_offset)
}

/// Physical partition containing `epoch`, `partition_width_in_buckets`
/// buckets of `bucket_width` epochs wide.
pub fn partition_range(
    epoch: u64,
    partition_width_in_buckets: u64,
    bucket_width: u64,
) -> (u64, u64) {
    let width = partition_width_in_buckets * bucket_width;
    let start = epoch / width * width;
    (start, start + width)
}

/// Chain timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    /// Unix timestamp of epoch 0
    pub genesis_timestamp: i64,
    pub seconds_per_epoch: u64,
}

impl ChainSpec {
    pub fn new(genesis_timestamp: i64, seconds_per_epoch: u64) -> Self {
        Self {
            genesis_timestamp,
            seconds_per_epoch,
        }
    }

    pub fn epochs_per_day(&self) -> u64 {
        SECONDS_PER_DAY / self.seconds_per_epoch
    }

    pub fn hour_width(&self) -> u64 {
        self.epochs_per_day() / HOURS_PER_DAY
    }

    /// Epochs between the UTC midnight of the genesis day and genesis
    pub fn genesis_offset(&self) -> u64 {
        let into_day = self.genesis_timestamp.rem_euclid(SECONDS_PER_DAY as i64) as u64;
        into_day / self.seconds_per_epoch
    }

    pub fn hour_bounds(&self, epoch: u64) -> EpochRange {
        let (start, end) = bucket_bounds(epoch, self.hour_width(), self.genesis_offset());
        EpochRange::new(start, end)
    }

    pub fn day_bounds(&self, epoch: u64) -> EpochRange {
        let (start, end) = bucket_bounds(epoch, self.epochs_per_day(), self.genesis_offset());
        EpochRange::new(start, end)
    }

    pub fn hour_partition_range(&self, epoch: u64, width_in_hours: u64) -> EpochRange {
        let (start, end) = partition_range(epoch, width_in_hours, self.hour_width());
        EpochRange::new(start, end)
    }

    /// Day partitions are computed in the genesis-offset frame so that both
    /// ends fall on UTC midnights and survive a round trip through their
    /// date-encoded partition name.
    pub fn day_partition_range(&self, epoch: u64, width_in_days: u64) -> EpochRange {
        let offset = self.genesis_offset();
        let (start, end) = partition_range(epoch + offset, width_in_days, self.epochs_per_day());
        EpochRange::new(start.saturating_sub(offset), end - offset)
    }

    pub fn epoch_to_time(&self, epoch: u64) -> DateTime<Utc> {
        let secs = epoch
            .saturating_mul(self.seconds_per_epoch)
            .min(i64::MAX as u64) as i64;
        DateTime::from_timestamp(self.genesis_timestamp.saturating_add(secs), 0)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn epoch_to_day(&self, epoch: u64) -> NaiveDate {
        self.epoch_to_time(epoch).date_naive()
    }

    /// First epoch of the day bucket for the UTC date `day`
    pub fn day_to_epoch(&self, day: NaiveDate) -> u64 {
        let genesis_day = self.epoch_to_day(0);
        let days = (day - genesis_day).num_days();
        if days <= 0 {
            return 0;
        }
        (days as u64 * self.epochs_per_day()).saturating_sub(self.genesis_offset())
    }
}
