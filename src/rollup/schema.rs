//! Table layouts and the metric column catalog
//!
//! Every CREATE/INSERT statement in the engine is generated from the catalog
//! below, so the raw, bucket, and rolling tables can never drift apart.

use rusqlite::Connection;

use super::error::{Result, StoreContext};

pub const EPOCH_TABLE: &str = "validator_dashboard_data_epoch";
pub const HOURLY_TABLE: &str = "validator_dashboard_data_hourly";
pub const DAILY_TABLE: &str = "validator_dashboard_data_daily";
pub const ROLLING_1H_TABLE: &str = "validator_dashboard_data_rolling_1h";
pub const ROLLING_24H_TABLE: &str = "validator_dashboard_data_rolling_24h";

/// Additive counters and sums, merged with `+`
pub const SUM_COLUMNS: &[&str] = &[
    "attestations_source_reward",
    "attestations_target_reward",
    "attestations_head_reward",
    "attestations_inactivity_reward",
    "attestations_inclusion_reward",
    "attestations_reward",
    "attestations_ideal_source_reward",
    "attestations_ideal_target_reward",
    "attestations_ideal_head_reward",
    "attestations_ideal_inactivity_reward",
    "attestations_ideal_inclusion_reward",
    "attestations_ideal_reward",
    "blocks_scheduled",
    "blocks_proposed",
    "blocks_cl_reward",
    "sync_scheduled",
    "sync_executed",
    "sync_rewards",
    "deposits_count",
    "deposits_amount",
    "withdrawals_count",
    "withdrawals_amount",
    "inclusion_delay_sum",
    "block_chance",
    "attestations_scheduled",
    "attestations_executed",
    "attestation_head_executed",
    "attestation_source_executed",
    "attestation_target_executed",
    "optimal_inclusion_delay_sum",
    "slasher_reward",
];

/// Sticky flag, merged with logical OR
pub const SLASHED_COLUMN: &str = "slashed";

/// First non-null value wins on merge
pub const FIRST_WRITER_COLUMNS: &[&str] = &[
    "slashed_by",
    "slashed_violation",
    "last_executed_duty_epoch",
];

fn sum_column_type(column: &str) -> &'static str {
    match column {
        // probability sum
        "block_chance" => "REAL NOT NULL DEFAULT 0",
        _ => "INTEGER NOT NULL DEFAULT 0",
    }
}

/// Physical shape of a table holding metric rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLayout {
    /// Raw rows keyed by `(epoch, validator_index)`
    Epoch,
    /// Hour buckets keyed by `(epoch_start, validator_index)`
    Hourly,
    /// UTC-day buckets keyed by `(day, validator_index)`
    Daily,
    /// One trailing window row per validator
    Rolling,
}

impl TableLayout {
    /// Column list of the upsert conflict target
    pub fn conflict_target(&self) -> &'static str {
        match self {
            TableLayout::Epoch => "(epoch, validator_index)",
            TableLayout::Hourly => "(epoch_start, validator_index)",
            TableLayout::Daily => "(day, validator_index)",
            TableLayout::Rolling => "(validator_index)",
        }
    }

    pub fn create_table_sql(&self, name: &str) -> String {
        let (head, primary_key) = match self {
            TableLayout::Epoch => (
                "epoch INTEGER NOT NULL,\n    validator_index INTEGER NOT NULL,",
                "PRIMARY KEY (epoch, validator_index)",
            ),
            TableLayout::Hourly => (
                "epoch_start INTEGER NOT NULL,\n    epoch_end INTEGER NOT NULL,\n    validator_index INTEGER NOT NULL,",
                "PRIMARY KEY (epoch_start, validator_index)",
            ),
            TableLayout::Daily => (
                "day TEXT NOT NULL,\n    epoch_start INTEGER NOT NULL,\n    epoch_end INTEGER NOT NULL,\n    validator_index INTEGER NOT NULL,",
                "PRIMARY KEY (day, validator_index)",
            ),
            TableLayout::Rolling => (
                "validator_index INTEGER NOT NULL,\n    epoch_start INTEGER NOT NULL,\n    epoch_end INTEGER NOT NULL,",
                "PRIMARY KEY (validator_index)",
            ),
        };

        let mut columns = String::new();
        for column in SUM_COLUMNS {
            columns.push_str(&format!("    {} {},\n", column, sum_column_type(column)));
        }
        columns.push_str(&format!("    {} INTEGER NOT NULL DEFAULT 0,\n", SLASHED_COLUMN));
        for column in FIRST_WRITER_COLUMNS {
            columns.push_str(&format!("    {} INTEGER,\n", column));
        }
        columns.push_str("    balance_start INTEGER,\n    balance_end INTEGER,\n");

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n{}    {}\n)",
            name, head, columns, primary_key
        )
    }
}

/// Zero-row table fixing the column layout of a partitioned logical table
pub fn root_table(logical: &str) -> String {
    format!("{}__root", logical)
}

/// Create every non-partition table and the partition views (idempotent)
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    let mut ddl = vec![
        TableLayout::Epoch.create_table_sql(EPOCH_TABLE),
        TableLayout::Rolling.create_table_sql(ROLLING_1H_TABLE),
        TableLayout::Rolling.create_table_sql(ROLLING_24H_TABLE),
    ];

    for (logical, layout) in [
        (HOURLY_TABLE, TableLayout::Hourly),
        (DAILY_TABLE, TableLayout::Daily),
    ] {
        let root = root_table(logical);
        ddl.push(layout.create_table_sql(&root));
        ddl.push(format!(
            "CREATE VIEW IF NOT EXISTS {} AS SELECT * FROM {}",
            logical, root
        ));
    }

    for statement in ddl {
        conn.execute_batch(&statement)
            .with_context(|| format!("failed to apply schema statement: {}", statement))?;
    }

    log::info!("✅ Rollup schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'validator_dashboard_data_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        // epoch, two rolling, two roots
        assert_eq!(tables, 5);

        let views: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(views, 2);
    }

    #[test]
    fn test_layouts_share_metric_columns() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();

        for table in [EPOCH_TABLE, ROLLING_24H_TABLE, HOURLY_TABLE, DAILY_TABLE] {
            let mut stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT 0", table)).unwrap();
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            for column in SUM_COLUMNS.iter().chain(FIRST_WRITER_COLUMNS) {
                assert!(names.iter().any(|n| n == column), "{} missing {}", table, column);
            }
            assert!(names.iter().any(|n| n == "balance_end"));
        }
    }
}
