//! Time-range partitions of the hourly and daily bucket tables
//!
//! SQLite has no declarative partitioning, so a partitioned logical table
//! `T` is a zero-row `T__root` table, one physical table per time range, and
//! a view named `T` over the root and every partition. The view is rebuilt in
//! the same transaction as any partition create or drop.
//!
//! Partition names encode their range and are the only record of it:
//! `T_<from>_<to>` in epochs for hourly tables, `T_<YYYYMMDD>_<YYYYMMDD>` in
//! UTC dates for daily tables. Retention depends on decoding them again.

use chrono::NaiveDate;
use regex::Regex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::bounds::ChainSpec;
use super::error::{Result, RollupError, StoreContext};
use super::schema::{root_table, TableLayout};
use super::types::EpochRange;

const DAY_NAME_FORMAT: &str = "%Y%m%d";

/// How a bucket table is cut into partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    /// Epoch-numbered ranges, `width_in_hours` hour buckets each
    Epochs { width_in_hours: u64 },
    /// UTC-date ranges, `width_in_days` day buckets each
    Days { width_in_days: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub range: EpochRange,
}

pub struct PartitionManager {
    table: &'static str,
    layout: TableLayout,
    scheme: PartitionScheme,
    chain: ChainSpec,
    name_pattern: Regex,
}

impl PartitionManager {
    pub fn new(
        table: &'static str,
        layout: TableLayout,
        scheme: PartitionScheme,
        chain: ChainSpec,
    ) -> Result<Self> {
        let bound = match scheme {
            PartitionScheme::Epochs { .. } => r"\d+",
            PartitionScheme::Days { .. } => r"\d{8}",
        };
        let name_pattern = Regex::new(&format!(
            r"^{}_({})_({})$",
            regex::escape(table),
            bound,
            bound
        ))?;

        Ok(Self {
            table,
            layout,
            scheme,
            chain,
            name_pattern,
        })
    }

    /// Partition range containing `epoch`; never arbitrary, so partitions
    /// tile the timeline even when created out of order.
    pub fn partition_range(&self, epoch: u64) -> EpochRange {
        match self.scheme {
            PartitionScheme::Epochs { width_in_hours } => {
                self.chain.hour_partition_range(epoch, width_in_hours)
            }
            PartitionScheme::Days { width_in_days } => {
                self.chain.day_partition_range(epoch, width_in_days)
            }
        }
    }

    pub fn partition_name(&self, range: EpochRange) -> String {
        match self.scheme {
            PartitionScheme::Epochs { .. } => {
                format!("{}_{}_{}", self.table, range.from, range.to)
            }
            PartitionScheme::Days { .. } => format!(
                "{}_{}_{}",
                self.table,
                self.chain.epoch_to_day(range.from).format(DAY_NAME_FORMAT),
                self.chain.epoch_to_day(range.to).format(DAY_NAME_FORMAT)
            ),
        }
    }

    /// Decode the range a partition name encodes
    pub fn parse_partition_name(&self, name: &str) -> Result<EpochRange> {
        let invalid = || RollupError::PartitionName {
            name: name.to_string(),
        };
        let caps = self.name_pattern.captures(name).ok_or_else(invalid)?;
        let (from, to) = (&caps[1], &caps[2]);

        let range = match self.scheme {
            PartitionScheme::Epochs { .. } => EpochRange::new(
                from.parse().map_err(|_| invalid())?,
                to.parse().map_err(|_| invalid())?,
            ),
            PartitionScheme::Days { .. } => {
                let from = NaiveDate::parse_from_str(from, DAY_NAME_FORMAT).map_err(|_| invalid())?;
                let to = NaiveDate::parse_from_str(to, DAY_NAME_FORMAT).map_err(|_| invalid())?;
                EpochRange::new(self.chain.day_to_epoch(from), self.chain.day_to_epoch(to))
            }
        };

        if range.is_empty() {
            return Err(invalid());
        }
        Ok(range)
    }

    /// Existing partitions ordered by range
    pub fn list_partitions(&self, conn: &Connection) -> Result<Vec<Partition>> {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name GLOB ?1",
            )
            .context("failed to prepare partition listing")?;
        let names = stmt
            .query_map(params![format!("{}_[0-9]*", self.table)], |row| {
                row.get::<_, String>(0)
            })
            .with_context(|| format!("failed to list partitions of {}", self.table))?;

        let mut partitions = Vec::new();
        for name in names {
            let name = name.with_context(|| format!("failed to read partition of {}", self.table))?;
            let range = self.parse_partition_name(&name)?;
            partitions.push(Partition { name, range });
        }
        partitions.sort_by_key(|p| p.range);
        Ok(partitions)
    }

    /// Create the partition covering `epoch` unless it already exists.
    /// Run inside the transaction of the write that needs it.
    pub fn ensure_partition(&self, conn: &Connection, epoch: u64) -> Result<Partition> {
        let range = self.partition_range(epoch);
        let name = self.partition_name(range);

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                params![name],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to look up partition {}", name))?;

        if !exists {
            conn.execute_batch(&self.layout.create_table_sql(&name))
                .map_err(|source| RollupError::Partition {
                    name: name.clone(),
                    source,
                })?;
            self.rebuild_view(conn)?;
            log::info!("📦 Created partition {} for epochs {}", name, range);
        }

        Ok(Partition { name, range })
    }

    /// Drop every partition whose range ends at or before `below`.
    /// Partitions reaching past `below` are kept.
    pub fn drop_partitions_below(&self, conn: &Connection, below: u64) -> Result<Vec<Partition>> {
        let stale: Vec<Partition> = self
            .list_partitions(conn)?
            .into_iter()
            .filter(|p| p.range.to <= below)
            .collect();

        if stale.is_empty() {
            return Ok(stale);
        }

        for partition in &stale {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", partition.name))
                .map_err(|source| RollupError::Partition {
                    name: partition.name.clone(),
                    source,
                })?;
        }
        self.rebuild_view(conn)?;

        for partition in &stale {
            log::info!("🗑️  Dropped partition {} ({})", partition.name, partition.range);
        }
        Ok(stale)
    }

    /// Point the logical view at the root table plus every current partition
    fn rebuild_view(&self, conn: &Connection) -> Result<()> {
        let mut select = format!("SELECT * FROM {}", root_table(self.table));
        for partition in self.list_partitions(conn)? {
            select.push_str(&format!("\nUNION ALL SELECT * FROM {}", partition.name));
        }

        let ddl = format!(
            "DROP VIEW IF EXISTS {table};\nCREATE VIEW {table} AS {select};",
            table = self.table,
            select = select
        );
        conn.execute_batch(&ddl)
            .map_err(|source| RollupError::Partition {
                name: self.table.to_string(),
                source,
            })
    }
}
