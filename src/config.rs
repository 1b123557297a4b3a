//! Rollup configuration from environment variables

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::rollup::bounds::{ChainSpec, SECONDS_PER_DAY};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVariable(String),
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Configuration for the rollup engine and its runtime
///
/// Loaded from environment variables with defaults for a 32-slot, 12-second
/// chain.
#[derive(Debug, Clone)]
pub struct RollupConfig {
    /// Path to SQLite database file
    pub db_path: PathBuf,

    pub chain: ChainSpec,

    /// Hour buckets per hourly partition
    pub hour_partition_width: u64,

    /// Days per daily partition
    pub day_partition_width: u64,

    /// Hourly partitions ending this many epochs behind the head are dropped
    pub hour_retention_epochs: u64,

    /// Skip hour passes while further behind than this many epochs
    pub hour_catchup_limit: Option<u64>,

    /// Scheduler poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Where the runtime writes its JSON status snapshot
    pub status_path: PathBuf,
}

fn parsed_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", name, raw))),
        Err(_) => Ok(None),
    }
}

impl RollupConfig {
    pub const DEFAULT_SECONDS_PER_EPOCH: u64 = 384;

    /// Defaults for `chain`, database in the working directory
    pub fn new(chain: ChainSpec) -> Self {
        Self {
            db_path: PathBuf::from("epochflow.db"),
            chain,
            hour_partition_width: 24,
            day_partition_width: 6,
            hour_retention_epochs: 7 * chain.epochs_per_day(),
            hour_catchup_limit: None,
            poll_interval_ms: 12_000,
            status_path: PathBuf::from("rollup_status.json"),
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `GENESIS_TIMESTAMP` (required, unix seconds)
    /// - `SECONDS_PER_EPOCH` (default: 384)
    /// - `EPOCHFLOW_DB_PATH` (default: epochflow.db)
    /// - `HOUR_PARTITION_WIDTH` (default: 24)
    /// - `DAY_PARTITION_WIDTH` (default: 6)
    /// - `HOUR_RETENTION_EPOCHS` (default: 7 days of epochs)
    /// - `HOUR_CATCHUP_LIMIT_EPOCHS` (default: unset)
    /// - `ROLLUP_POLL_INTERVAL_MS` (default: 12000)
    /// - `ROLLUP_STATUS_PATH` (default: rollup_status.json)
    pub fn from_env() -> Result<Self, ConfigError> {
        let genesis_timestamp: i64 = parsed_var("GENESIS_TIMESTAMP")?
            .ok_or_else(|| ConfigError::MissingVariable("GENESIS_TIMESTAMP".to_string()))?;
        let seconds_per_epoch =
            parsed_var("SECONDS_PER_EPOCH")?.unwrap_or(Self::DEFAULT_SECONDS_PER_EPOCH);
        if seconds_per_epoch == 0 {
            return Err(ConfigError::InvalidValue(
                "SECONDS_PER_EPOCH must be greater than 0".to_string(),
            ));
        }

        let mut config = Self::new(ChainSpec::new(genesis_timestamp, seconds_per_epoch));

        if let Ok(path) = env::var("EPOCHFLOW_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(width) = parsed_var("HOUR_PARTITION_WIDTH")? {
            config.hour_partition_width = width;
        }
        if let Some(width) = parsed_var("DAY_PARTITION_WIDTH")? {
            config.day_partition_width = width;
        }
        if let Some(epochs) = parsed_var("HOUR_RETENTION_EPOCHS")? {
            config.hour_retention_epochs = epochs;
        }
        config.hour_catchup_limit = parsed_var("HOUR_CATCHUP_LIMIT_EPOCHS")?;
        if let Some(ms) = parsed_var("ROLLUP_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = ms;
        }
        if let Ok(path) = env::var("ROLLUP_STATUS_PATH") {
            config.status_path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject clocks whose hour buckets do not tile days, empty partitions,
    /// and hour retention too short for the 24h window
    pub fn validate(&self) -> Result<(), ConfigError> {
        let spe = self.chain.seconds_per_epoch;
        if spe == 0 || SECONDS_PER_DAY % spe != 0 {
            return Err(ConfigError::InvalidValue(format!(
                "seconds per epoch {} does not divide a day",
                spe
            )));
        }

        let hour_width = self.chain.hour_width();
        if hour_width == 0 || self.chain.epochs_per_day() % hour_width != 0 {
            return Err(ConfigError::InvalidValue(format!(
                "hour buckets of {} epochs do not tile a day of {} epochs",
                hour_width,
                self.chain.epochs_per_day()
            )));
        }

        if self.hour_partition_width == 0 || self.day_partition_width == 0 {
            return Err(ConfigError::InvalidValue(
                "partition widths must be greater than 0".to_string(),
            ));
        }

        // the 24h bootstrap reads the hour row a day behind the head, and
        // retention drops whole partitions
        let min_retention =
            self.chain.epochs_per_day() + self.hour_partition_width * hour_width;
        if self.hour_retention_epochs < min_retention {
            return Err(ConfigError::InvalidValue(format!(
                "hour retention of {} epochs is below one day plus one hourly partition ({} epochs)",
                self.hour_retention_epochs, min_retention
            )));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // tests below share the process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "GENESIS_TIMESTAMP",
        "SECONDS_PER_EPOCH",
        "EPOCHFLOW_DB_PATH",
        "HOUR_PARTITION_WIDTH",
        "DAY_PARTITION_WIDTH",
        "HOUR_RETENTION_EPOCHS",
        "HOUR_CATCHUP_LIMIT_EPOCHS",
        "ROLLUP_POLL_INTERVAL_MS",
        "ROLLUP_STATUS_PATH",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        env::set_var("GENESIS_TIMESTAMP", "1606824023");

        let config = RollupConfig::from_env().unwrap();

        assert_eq!(config.db_path, PathBuf::from("epochflow.db"));
        assert_eq!(config.chain.seconds_per_epoch, 384);
        assert_eq!(config.hour_partition_width, 24);
        assert_eq!(config.day_partition_width, 6);
        assert_eq!(config.hour_retention_epochs, 7 * 225);
        assert_eq!(config.hour_catchup_limit, None);
        assert_eq!(config.poll_interval(), Duration::from_secs(12));

        clear_env();
    }

    #[test]
    fn test_custom_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        env::set_var("GENESIS_TIMESTAMP", "1600041600");
        env::set_var("SECONDS_PER_EPOCH", "900");
        env::set_var("EPOCHFLOW_DB_PATH", "/tmp/rollup.db");
        env::set_var("HOUR_CATCHUP_LIMIT_EPOCHS", "64");
        env::set_var("ROLLUP_POLL_INTERVAL_MS", "500");

        let config = RollupConfig::from_env().unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/rollup.db"));
        assert_eq!(config.chain.hour_width(), 4);
        assert_eq!(config.hour_catchup_limit, Some(64));
        assert_eq!(config.poll_interval_ms, 500);

        clear_env();
    }

    #[test]
    fn test_missing_and_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        assert_eq!(
            RollupConfig::from_env().unwrap_err(),
            ConfigError::MissingVariable("GENESIS_TIMESTAMP".to_string())
        );

        env::set_var("GENESIS_TIMESTAMP", "not-a-number");
        assert!(matches!(
            RollupConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));

        // 7-second epochs do not divide a day
        env::set_var("GENESIS_TIMESTAMP", "0");
        env::set_var("SECONDS_PER_EPOCH", "7");
        assert!(matches!(
            RollupConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));

        clear_env();
    }

    #[test]
    fn test_validate_rejects_uneven_hours() {
        // 24 epochs per day, one per hour
        assert!(RollupConfig::new(ChainSpec::new(0, 3600)).validate().is_ok());
        // 12 epochs per day, hour buckets would be empty
        assert!(RollupConfig::new(ChainSpec::new(0, 7200)).validate().is_err());
        // 225 epochs per day in 25 buckets of 9
        assert!(RollupConfig::new(ChainSpec::new(0, 384)).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_hour_retention() {
        // 96 epochs per day, hourly partitions of 24 * 4 epochs
        let mut config = RollupConfig::new(ChainSpec::new(1_600_041_600, 900));
        config.hour_retention_epochs = 192;
        assert!(config.validate().is_ok());

        config.hour_retention_epochs = 191;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        config.hour_partition_width = 6;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_short_hour_retention_from_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        env::set_var("GENESIS_TIMESTAMP", "1606824023");
        env::set_var("HOUR_RETENTION_EPOCHS", "225");

        assert!(matches!(
            RollupConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));

        clear_env();
    }
}
