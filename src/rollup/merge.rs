//! Conflict-resolving merge write
//!
//! One `WITH ... INSERT ... ON CONFLICT DO UPDATE` statement sums a source
//! range per validator and folds it into a destination bucket:
//!
//! - additive columns: destination + added range (- evicted range)
//! - `slashed`: logical OR, never cleared
//! - first-writer columns: existing non-null value wins
//! - `balance_end`: latest added row
//! - `balance_start`: taken from the pinned tail epoch on insert; buckets
//!   keep it, rolling windows move it with the tail
//!
//! Merging the same range twice double counts. Callers resume from the last
//! committed `epoch_end` and never resubmit a range.

use rusqlite::{Connection, ToSql};

use super::error::{Result, StoreContext};
use super::schema::{
    TableLayout, EPOCH_TABLE, FIRST_WRITER_COLUMNS, HOURLY_TABLE, SLASHED_COLUMN, SUM_COLUMNS,
};
use super::types::EpochRange;

/// Where the rows summed by a merge come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTable {
    /// Raw per-epoch rows
    Epochs,
    /// Hour buckets lying fully inside the range, with raw rows filling in
    /// whatever they do not cover
    HourBuckets,
}

impl SourceTable {
    /// Rows of `[:{p}_from, :{p}_to)` carrying `sign`
    fn rows_sql(&self, p: &str, sign: i64) -> String {
        let metrics = metric_select_list();
        let raw = |extra: &str| {
            format!(
                "SELECT e.validator_index, e.epoch AS last_epoch, {sign} AS sign, {metrics}
                 FROM {epoch} e
                 WHERE e.epoch >= :{p}_from AND e.epoch < :{p}_to{extra}",
                sign = sign,
                metrics = metrics.replace("{t}", "e"),
                epoch = EPOCH_TABLE,
                p = p,
                extra = extra
            )
        };

        match self {
            SourceTable::Epochs => raw(""),
            SourceTable::HourBuckets => {
                let covered = format!(
                    "h.epoch_start >= :{p}_from AND h.epoch_end <= :{p}_to",
                    p = p
                );
                let hours = format!(
                    "SELECT h.validator_index, h.epoch_end - 1 AS last_epoch, {sign} AS sign, {metrics}
                     FROM {hourly} h
                     WHERE {covered}",
                    sign = sign,
                    metrics = metrics.replace("{t}", "h"),
                    hourly = HOURLY_TABLE,
                    covered = covered
                );
                let uncovered = format!(
                    "\n                   AND NOT EXISTS (
                       SELECT 1 FROM {hourly} h
                       WHERE h.validator_index = e.validator_index
                         AND h.epoch_start <= e.epoch AND e.epoch < h.epoch_end
                         AND {covered})",
                    hourly = HOURLY_TABLE,
                    covered = covered
                );
                format!("{}\n                 UNION ALL\n                 {}", hours, raw(&uncovered))
            }
        }
    }
}

fn metric_select_list() -> String {
    let mut columns: Vec<String> = SUM_COLUMNS.iter().map(|c| format!("{{t}}.{}", c)).collect();
    columns.push(format!("{{t}}.{}", SLASHED_COLUMN));
    columns.extend(FIRST_WRITER_COLUMNS.iter().map(|c| format!("{{t}}.{}", c)));
    columns.push("{t}.balance_end".to_string());
    columns.join(", ")
}

/// Destination of a merge write
#[derive(Debug, Clone)]
pub struct MergeTarget {
    /// Physical table receiving the rows (a partition for bucket tables)
    pub table: String,
    pub layout: TableLayout,
    /// `YYYY-MM-DD` label, daily buckets only
    pub day: Option<String>,
}

impl MergeTarget {
    pub fn hourly(partition: impl Into<String>) -> Self {
        Self {
            table: partition.into(),
            layout: TableLayout::Hourly,
            day: None,
        }
    }

    pub fn daily(partition: impl Into<String>, day: impl Into<String>) -> Self {
        Self {
            table: partition.into(),
            layout: TableLayout::Daily,
            day: Some(day.into()),
        }
    }

    pub fn rolling(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            layout: TableLayout::Rolling,
            day: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergeRequest {
    pub source: SourceTable,
    /// Range summed with `+`
    pub add: EpochRange,
    /// Range summed with `-` (rolling windows moving their tail)
    pub evict: Option<EpochRange>,
    /// Bucket or window start; `balance_start` is read at this epoch
    pub start_bound_epoch: u64,
    /// Value written to `epoch_end`
    pub epoch_end: u64,
}

impl MergeRequest {
    pub fn bucket(source: SourceTable, add: EpochRange, bucket_start: u64) -> Self {
        Self {
            source,
            add,
            evict: None,
            start_bound_epoch: bucket_start,
            epoch_end: add.to,
        }
    }

    fn is_noop(&self) -> bool {
        self.add.is_empty() && self.evict.map_or(true, |r| r.is_empty())
    }
}

fn merge_sql(target: &MergeTarget, request: &MergeRequest) -> String {
    let mut sources = vec![request.source.rows_sql("add", 1)];
    if request.evict.is_some() {
        sources.push(request.source.rows_sql("evict", -1));
    }

    let mut aggregates = vec!["validator_index".to_string()];
    aggregates.extend(SUM_COLUMNS.iter().map(|c| format!("SUM(sign * {c}) AS {c}", c = c)));
    aggregates.push(format!(
        "COALESCE(MAX(CASE WHEN sign > 0 THEN {c} END), 0) AS {c}",
        c = SLASHED_COLUMN
    ));
    aggregates.extend(
        FIRST_WRITER_COLUMNS
            .iter()
            .map(|c| format!("MAX(CASE WHEN sign > 0 THEN {c} END) AS {c}", c = c)),
    );

    let (key_columns, key_values) = match target.layout {
        TableLayout::Daily => (
            "day, epoch_start, epoch_end, validator_index",
            ":day, :start_bound, :epoch_end, agg.validator_index",
        ),
        _ => (
            "epoch_start, epoch_end, validator_index",
            ":start_bound, :epoch_end, agg.validator_index",
        ),
    };

    let metric_columns: Vec<&str> = SUM_COLUMNS
        .iter()
        .chain(std::iter::once(&SLASHED_COLUMN))
        .chain(FIRST_WRITER_COLUMNS.iter())
        .copied()
        .collect();
    let metric_values: Vec<String> = metric_columns.iter().map(|c| format!("agg.{}", c)).collect();

    let dest = &target.table;
    let mut updates: Vec<String> = SUM_COLUMNS
        .iter()
        .map(|c| format!("{c} = {d}.{c} + excluded.{c}", c = c, d = dest))
        .collect();
    updates.push(format!(
        "{c} = MAX({d}.{c}, excluded.{c})",
        c = SLASHED_COLUMN,
        d = dest
    ));
    updates.extend(
        FIRST_WRITER_COLUMNS
            .iter()
            .map(|c| format!("{c} = COALESCE({d}.{c}, excluded.{c})", c = c, d = dest)),
    );
    updates.push(format!(
        "balance_end = COALESCE(excluded.balance_end, {}.balance_end)",
        dest
    ));
    updates.push("epoch_end = excluded.epoch_end".to_string());
    if target.layout == TableLayout::Rolling {
        updates.push("epoch_start = excluded.epoch_start".to_string());
        updates.push(format!(
            "balance_start = COALESCE(excluded.balance_start, {}.balance_start)",
            dest
        ));
    }

    format!(
        "WITH src(validator_index, last_epoch, sign, {metric_columns}, balance_end) AS (
                 {sources}
             ),
             agg AS (
                 SELECT {aggregates}
                 FROM src
                 GROUP BY validator_index
             ),
             ends AS (
                 SELECT validator_index, balance_end FROM (
                     SELECT validator_index, balance_end,
                            ROW_NUMBER() OVER (PARTITION BY validator_index ORDER BY last_epoch DESC) AS rn
                     FROM src WHERE sign > 0
                 ) WHERE rn = 1
             ),
             starts AS (
                 SELECT validator_index, balance_start FROM {epoch} WHERE epoch = :start_bound
                 UNION ALL
                 SELECT h.validator_index, h.balance_start FROM {hourly} h
                 WHERE h.epoch_start = :start_bound
                   AND NOT EXISTS (
                       SELECT 1 FROM {epoch} e
                       WHERE e.epoch = :start_bound AND e.validator_index = h.validator_index)
             )
         INSERT INTO {dest} ({key_columns}, {metric_columns}, balance_start, balance_end)
         SELECT {key_values}, {metric_values}, starts.balance_start, ends.balance_end
         FROM agg
         LEFT JOIN starts ON starts.validator_index = agg.validator_index
         LEFT JOIN ends ON ends.validator_index = agg.validator_index
         WHERE true
         ON CONFLICT {conflict} DO UPDATE SET
             {updates}",
        sources = sources.join("\n                 UNION ALL\n                 "),
        aggregates = aggregates.join(",\n                        "),
        epoch = EPOCH_TABLE,
        hourly = HOURLY_TABLE,
        dest = dest,
        key_columns = key_columns,
        metric_columns = metric_columns.join(", "),
        key_values = key_values,
        metric_values = metric_values.join(", "),
        conflict = target.layout.conflict_target(),
        updates = updates.join(",\n             "),
    )
}

/// Fold `request` into `target`. Returns the number of validator rows
/// written; a request with nothing to add or evict writes nothing.
pub fn merge_into(conn: &Connection, target: &MergeTarget, request: &MergeRequest) -> Result<usize> {
    if request.is_noop() {
        return Ok(0);
    }

    let sql = merge_sql(target, request);
    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("failed to prepare merge into {}", target.table))?;

    let mut params: Vec<(&str, &dyn ToSql)> = vec![
        (":add_from", &request.add.from),
        (":add_to", &request.add.to),
        (":start_bound", &request.start_bound_epoch),
        (":epoch_end", &request.epoch_end),
    ];
    if let Some(evict) = &request.evict {
        params.push((":evict_from", &evict.from));
        params.push((":evict_to", &evict.to));
    }
    if let Some(day) = &target.day {
        params.push((":day", day));
    }

    let written = stmt.execute(params.as_slice()).with_context(|| match &request.evict {
        Some(evict) => format!(
            "failed to merge +{} -{} into {}",
            request.add, evict, target.table
        ),
        None => format!("failed to merge {} into {}", request.add, target.table),
    })?;

    log::debug!(
        "merged +{} -{:?} into {}: {} rows",
        request.add,
        request.evict,
        target.table,
        written
    );
    Ok(written)
}
