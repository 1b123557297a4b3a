//! Fixed-width trailing windows
//!
//! One engine keeps a rolling table current for any granularity. A
//! [`RollingPolicy`] tells it where the window reads from, how wide it is,
//! and when falling behind means rebuilding instead of shifting.
//!
//! States per table: empty (never built), bootstrapped, steady. Every
//! successful call leaves all rows spanning exactly
//! `[max(0, head + 1 - width), head + 1)`.

use rusqlite::{params, Connection};
use std::time::Instant;

use super::bounds::ChainSpec;
use super::error::{Result, RollupError, StoreContext};
use super::gaps::{ensure_no_gaps, EpochGapSource};
use super::merge::{merge_into, MergeRequest, MergeTarget, SourceTable};
use super::schema::{EPOCH_TABLE, HOURLY_TABLE, ROLLING_1H_TABLE, ROLLING_24H_TABLE};
use super::store::begin_write;
use super::types::EpochRange;

/// Per-granularity behaviour of a rolling window
pub trait RollingPolicy {
    /// Rolling table maintained by the engine
    fn table(&self) -> &'static str;

    /// Fine-grained rows the window sums
    fn source(&self) -> SourceTable;

    fn window_width(&self) -> u64;

    /// How many epochs the window may lag behind the head before a shift is
    /// replaced by a full rebuild
    fn bootstrap_on_epochs_behind(&self) -> u64;

    /// Start of the fine bucket containing `epoch`
    fn fine_bucket_start(&self, epoch: u64) -> u64;

    /// Inclusive `(tail, head)` fine bucket starts summed by a rebuild, given
    /// the start of the latest fine bucket
    fn bootstrap_bounds(&self, latest_fine_start: u64) -> (u64, u64);
}

/// Trailing hour over raw epochs
#[derive(Debug, Clone, Copy)]
pub struct HourlyRollingPolicy {
    chain: ChainSpec,
}

impl HourlyRollingPolicy {
    pub fn new(chain: ChainSpec) -> Self {
        Self { chain }
    }
}

impl RollingPolicy for HourlyRollingPolicy {
    fn table(&self) -> &'static str {
        ROLLING_1H_TABLE
    }

    fn source(&self) -> SourceTable {
        SourceTable::Epochs
    }

    fn window_width(&self) -> u64 {
        self.chain.hour_width()
    }

    fn bootstrap_on_epochs_behind(&self) -> u64 {
        self.chain.hour_width()
    }

    fn fine_bucket_start(&self, epoch: u64) -> u64 {
        epoch
    }

    fn bootstrap_bounds(&self, latest_fine_start: u64) -> (u64, u64) {
        let tail = (latest_fine_start + 1).saturating_sub(self.window_width());
        (tail, latest_fine_start)
    }
}

/// Trailing 24 hours over hour buckets
#[derive(Debug, Clone, Copy)]
pub struct DailyRollingPolicy {
    chain: ChainSpec,
}

impl DailyRollingPolicy {
    pub fn new(chain: ChainSpec) -> Self {
        Self { chain }
    }
}

impl RollingPolicy for DailyRollingPolicy {
    fn table(&self) -> &'static str {
        ROLLING_24H_TABLE
    }

    fn source(&self) -> SourceTable {
        SourceTable::HourBuckets
    }

    fn window_width(&self) -> u64 {
        self.chain.epochs_per_day()
    }

    fn bootstrap_on_epochs_behind(&self) -> u64 {
        self.chain.hour_width()
    }

    fn fine_bucket_start(&self, epoch: u64) -> u64 {
        self.chain.hour_bounds(epoch).from
    }

    fn bootstrap_bounds(&self, latest_fine_start: u64) -> (u64, u64) {
        let tail = self
            .chain
            .hour_bounds(latest_fine_start.saturating_sub(self.chain.epochs_per_day()))
            .from;
        (tail, latest_fine_start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingOutcome {
    /// Window already covered the requested head
    Unchanged(EpochRange),
    /// Table rebuilt from scratch
    Bootstrapped(EpochRange),
    /// Window shifted forward incrementally
    Advanced(EpochRange),
}

impl RollingOutcome {
    pub fn window(&self) -> EpochRange {
        match self {
            RollingOutcome::Unchanged(w)
            | RollingOutcome::Bootstrapped(w)
            | RollingOutcome::Advanced(w) => *w,
        }
    }
}

pub struct RollingAggregator<P: RollingPolicy> {
    policy: P,
}

impl<P: RollingPolicy> RollingAggregator<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }

    /// Window that ends right after `head_epoch`
    pub fn target_window(&self, head_epoch: u64) -> EpochRange {
        let end = head_epoch + 1;
        EpochRange::new(end.saturating_sub(self.policy.window_width()), end)
    }

    /// Range currently held by the rolling table, `None` while empty
    pub fn window(&self, conn: &Connection) -> Result<Option<EpochRange>> {
        let sql = format!(
            "SELECT MIN(epoch_start), MAX(epoch_end) FROM {}",
            self.policy.table()
        );
        let bounds: (Option<u64>, Option<u64>) = conn
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .with_context(|| format!("failed to read window of {}", self.policy.table()))?;

        Ok(match bounds {
            (Some(from), Some(to)) => Some(EpochRange::new(from, to)),
            _ => None,
        })
    }

    /// Bring the window to end right after `head_epoch`
    pub fn aggregate(&self, conn: &mut Connection, head_epoch: u64) -> Result<RollingOutcome> {
        let target = self.target_window(head_epoch);
        let current = self.window(conn)?;

        let bootstrap = match current {
            None => true,
            Some(window) if window == target => return Ok(RollingOutcome::Unchanged(window)),
            Some(window) => {
                target.to < window.to
                    || target.to - window.to > self.policy.bootstrap_on_epochs_behind()
            }
        };

        let tx = begin_write(conn, || {
            format!("failed to begin {} window {}", self.policy.table(), target)
        })?;
        let outcome = match current {
            Some(window) if !bootstrap => {
                self.shift(&tx, window, target)?;
                RollingOutcome::Advanced(target)
            }
            _ => {
                self.bootstrap(&tx, head_epoch, target)?;
                RollingOutcome::Bootstrapped(target)
            }
        };
        self.pin_bounds(&tx, target)?;
        tx.commit()
            .with_context(|| format!("failed to commit {} window {}", self.policy.table(), target))?;

        Ok(outcome)
    }

    /// Raw epochs missing from the partial fine bucket at the tail of the
    /// window ending at `head_epoch`. Shifts and rebuilds evict that part from
    /// raw rows, so upstream has to backfill these first.
    pub fn missing_tail_epochs(&self, conn: &Connection, head_epoch: u64) -> Result<Vec<EpochRange>> {
        let target = self.target_window(head_epoch);
        let tail = EpochRange::new(self.policy.fine_bucket_start(target.from), target.from);
        conn.epoch_gaps_between(tail)
    }

    fn bootstrap(&self, conn: &Connection, head_epoch: u64, target: EpochRange) -> Result<()> {
        let started = Instant::now();
        let table = self.policy.table();
        let (tail, _) = self
            .policy
            .bootstrap_bounds(self.policy.fine_bucket_start(head_epoch));
        let tail = tail.min(target.from);

        if !self.fine_row_exists(conn, tail)? {
            return Err(RollupError::BootstrapPrereq {
                table: table.to_string(),
                epoch: tail,
            });
        }

        let add = EpochRange::new(tail, target.to);
        if self.policy.source() == SourceTable::Epochs {
            ensure_no_gaps(conn, add)?;
        }

        conn.execute(&format!("DELETE FROM {}", table), [])
            .with_context(|| format!("failed to truncate {}", table))?;

        let evict = EpochRange::new(tail, target.from);
        let rows = merge_into(
            conn,
            &MergeTarget::rolling(table),
            &MergeRequest {
                source: self.policy.source(),
                add,
                evict: (!evict.is_empty()).then_some(evict),
                start_bound_epoch: target.from,
                epoch_end: target.to,
            },
        )?;

        log::info!(
            "🔄 Bootstrapped {} to {} from tail {} ({} validators, {:?})",
            table,
            target,
            tail,
            rows,
            started.elapsed()
        );
        Ok(())
    }

    fn shift(&self, conn: &Connection, window: EpochRange, target: EpochRange) -> Result<()> {
        let add = EpochRange::new(window.to, target.to);
        let evict = EpochRange::new(window.from, target.from.max(window.from));
        if self.policy.source() == SourceTable::Epochs {
            ensure_no_gaps(conn, add)?;
        }

        let rows = merge_into(
            conn,
            &MergeTarget::rolling(self.policy.table()),
            &MergeRequest {
                source: self.policy.source(),
                add,
                evict: (!evict.is_empty()).then_some(evict),
                start_bound_epoch: target.from,
                epoch_end: target.to,
            },
        )?;

        log::debug!(
            "{} shifted {} -> {} ({} validators touched)",
            self.policy.table(),
            window,
            target,
            rows
        );
        Ok(())
    }

    /// Validators without rows in the added or evicted range still share the
    /// window bounds
    fn pin_bounds(&self, conn: &Connection, target: EpochRange) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET epoch_start = ?1, epoch_end = ?2
             WHERE epoch_start != ?1 OR epoch_end != ?2",
            self.policy.table()
        );
        conn.execute(&sql, params![target.from, target.to])
            .with_context(|| format!("failed to pin {} to {}", self.policy.table(), target))?;
        Ok(())
    }

    fn fine_row_exists(&self, conn: &Connection, epoch: u64) -> Result<bool> {
        let (table, key) = match self.policy.source() {
            SourceTable::Epochs => (EPOCH_TABLE, "epoch"),
            SourceTable::HourBuckets => (HOURLY_TABLE, "epoch_start"),
        };
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1)", table, key);
        conn.query_row(&sql, params![epoch], |row| row.get(0))
            .with_context(|| format!("failed to look up tail {} in {}", epoch, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::schema::ensure_schema;
    use crate::rollup::testutil::insert_epochs;

    fn chain() -> ChainSpec {
        ChainSpec::new(1_600_041_600, 900)
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn window_reward(conn: &Connection, validator: u64) -> i64 {
        conn.query_row(
            &format!(
                "SELECT attestations_reward FROM {} WHERE validator_index = ?1",
                ROLLING_1H_TABLE
            ),
            [validator],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_policies_bootstrap_bounds() {
        let hourly = HourlyRollingPolicy::new(chain());
        assert_eq!(hourly.bootstrap_bounds(10), (7, 10));
        assert_eq!(hourly.bootstrap_bounds(1), (0, 1));

        let daily = DailyRollingPolicy::new(chain());
        assert_eq!(daily.bootstrap_bounds(100), (4, 100));
        assert_eq!(daily.bootstrap_bounds(40), (0, 40));
        assert_eq!(daily.fine_bucket_start(101), 100);
    }

    #[test]
    fn test_bootstrap_then_steady_keeps_width() {
        let mut conn = setup();
        insert_epochs(&conn, 0, 20, &[1, 2], 1);
        let rolling = RollingAggregator::new(HourlyRollingPolicy::new(chain()));

        let outcome = rolling.aggregate(&mut conn, 9).unwrap();
        assert_eq!(outcome, RollingOutcome::Bootstrapped(EpochRange::new(6, 10)));
        assert_eq!(window_reward(&conn, 1), 4);

        for head in 10..20 {
            let outcome = rolling.aggregate(&mut conn, head).unwrap();
            assert!(matches!(outcome, RollingOutcome::Advanced(_)));
            let window = rolling.window(&conn).unwrap().unwrap();
            assert_eq!(window.len(), 4);
            assert_eq!(window_reward(&conn, 2), 4);
        }

        let again = rolling.aggregate(&mut conn, 19).unwrap();
        assert_eq!(again, RollingOutcome::Unchanged(EpochRange::new(16, 20)));
    }

    #[test]
    fn test_falling_behind_rebuilds() {
        let mut conn = setup();
        insert_epochs(&conn, 0, 30, &[1], 1);
        let rolling = RollingAggregator::new(HourlyRollingPolicy::new(chain()));

        rolling.aggregate(&mut conn, 5).unwrap();
        let outcome = rolling.aggregate(&mut conn, 25).unwrap();
        assert_eq!(outcome, RollingOutcome::Bootstrapped(EpochRange::new(22, 26)));
        assert_eq!(window_reward(&conn, 1), 4);

        // moving backwards rebuilds too
        let outcome = rolling.aggregate(&mut conn, 12).unwrap();
        assert_eq!(outcome, RollingOutcome::Bootstrapped(EpochRange::new(9, 13)));
        assert_eq!(window_reward(&conn, 1), 4);
    }

    #[test]
    fn test_missing_tail_fails_bootstrap() {
        let mut conn = setup();
        insert_epochs(&conn, 8, 20, &[1], 1);
        let rolling = RollingAggregator::new(HourlyRollingPolicy::new(chain()));

        let err = rolling.aggregate(&mut conn, 9).unwrap_err();
        assert!(matches!(err, RollupError::BootstrapPrereq { epoch: 6, .. }));
        assert_eq!(rolling.window(&conn).unwrap(), None);

        assert!(rolling.aggregate(&mut conn, 12).is_ok());
    }

    #[test]
    fn test_daily_tail_epochs() {
        let conn = setup();
        insert_epochs(&conn, 0, 120, &[1], 1);
        conn.execute(&format!("DELETE FROM {} WHERE epoch = 5", EPOCH_TABLE), [])
            .unwrap();
        let rolling = RollingAggregator::new(DailyRollingPolicy::new(chain()));

        // window [6, 102): tail hour [4, 8) is partial
        assert_eq!(
            rolling.missing_tail_epochs(&conn, 101).unwrap(),
            vec![EpochRange::new(5, 6)]
        );
        // window [4, 100) starts on an hour boundary
        assert!(rolling.missing_tail_epochs(&conn, 99).unwrap().is_empty());
    }
}
