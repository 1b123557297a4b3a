//! epochflow: epoch → hour → day rollups of validator dashboard metrics
//! over a time-partitioned SQLite store.

pub mod config;
pub mod rollup;
pub mod sqlite_pragma;

pub use config::{ConfigError, RollupConfig};
pub use rollup::{DashboardRollup, RollupError, RollupStatus};
