//! Incremental bucket advancement shared by the hour and day aggregators
//!
//! A pass resumes from the last committed bucket, walks forward one bucket
//! at a time up to the bucket holding the current epoch, and merges only the
//! source epochs not yet folded in. Each bucket commits on its own together
//! with the partition it lands in, so a failure leaves every earlier bucket
//! committed and the next pass resumes right after it.

use rusqlite::Connection;
use std::time::Instant;

use super::error::{Result, StoreContext};
use super::gaps::ensure_no_gaps;
use super::merge::{merge_into, MergeRequest, MergeTarget, SourceTable};
use super::partition::{Partition, PartitionManager};
use super::store::{begin_write, earliest_exported_epoch, last_exported_bucket};
use super::types::{AggregationOutcome, EpochRange, ExportedBucket, Granularity};

/// Bucket grid of one granularity
pub trait BucketGrid {
    fn granularity(&self) -> Granularity;

    /// Logical bucket table
    fn table(&self) -> &'static str;

    fn source(&self) -> SourceTable;

    fn bucket_bounds(&self, epoch: u64) -> EpochRange;

    fn merge_target(&self, partition: Partition, bucket: EpochRange) -> MergeTarget;
}

/// Where the next pass picks up. Without any bucket yet, start at the bucket
/// holding the earliest raw epoch, as if everything before it was merged.
pub fn resume_point<G: BucketGrid>(conn: &Connection, grid: &G) -> Result<Option<ExportedBucket>> {
    if let Some(last) = last_exported_bucket(conn, grid.table())? {
        return Ok(Some(last));
    }

    Ok(earliest_exported_epoch(conn)?.map(|earliest| ExportedBucket {
        epoch_start: grid.bucket_bounds(earliest).from,
        epoch_end: earliest,
    }))
}

/// Merge everything up to and including `current_epoch` into the buckets of
/// `grid`
pub fn advance<G: BucketGrid>(
    conn: &mut Connection,
    grid: &G,
    partitions: &PartitionManager,
    current_epoch: u64,
    catchup_limit: Option<u64>,
) -> Result<AggregationOutcome> {
    let started = Instant::now();
    let granularity = grid.granularity();

    let last = match resume_point(conn, grid)? {
        Some(last) => last,
        None => {
            log::debug!("{} aggregation: no exported epochs yet", granularity);
            return Ok(AggregationOutcome::default());
        }
    };

    let pending = EpochRange::new(last.epoch_end, current_epoch + 1);
    if let Some(limit) = catchup_limit {
        if pending.len() > limit {
            log::warn!(
                "⚠️  {} aggregation is {} epochs behind (limit {}), skipping until caught up",
                granularity,
                pending.len(),
                limit
            );
            return Ok(AggregationOutcome::behind(pending.len()));
        }
    }

    ensure_no_gaps(&*conn, pending)?;

    let current_end_bound = grid.bucket_bounds(current_epoch).to;
    let mut outcome = AggregationOutcome::default();
    let mut bucket_start = last.epoch_start;
    let mut first = true;

    while bucket_start < current_end_bound {
        let bucket = grid.bucket_bounds(bucket_start);
        bucket_start = bucket.to;

        if last.epoch_end == bucket.to {
            outcome.closed_skipped += 1;
            first = false;
            continue;
        }

        let from = if first { last.epoch_end } else { bucket.from };
        first = false;
        let range = EpochRange::new(from, bucket.to.min(current_epoch + 1));
        if range.is_empty() {
            continue;
        }

        let tx = begin_write(conn, || format!("failed to begin {} bucket {}", granularity, bucket))?;
        let partition = partitions.ensure_partition(&tx, bucket.from)?;
        let rows = merge_into(
            &tx,
            &grid.merge_target(partition, bucket),
            &MergeRequest::bucket(grid.source(), range, bucket.from),
        )?;
        tx.commit()
            .with_context(|| format!("failed to commit {} bucket {} range {}", granularity, bucket, range))?;

        log::debug!(
            "{} bucket {}: merged epochs {}..={} ({} validators)",
            granularity,
            bucket,
            range.from,
            range.last().unwrap_or(range.from),
            rows
        );
        outcome.merged.push(range);
    }

    if !outcome.merged.is_empty() {
        log::info!(
            "✅ {} aggregation up to epoch {}: {} bucket(s) written, {} closed ({:?})",
            granularity,
            current_epoch,
            outcome.buckets_written(),
            outcome.closed_skipped,
            started.elapsed()
        );
    }
    Ok(outcome)
}
