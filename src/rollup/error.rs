use thiserror::Error;

use super::types::{EpochRange, Granularity};
use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, RollupError>;

#[derive(Debug, Error)]
pub enum RollupError {
    /// Raw epoch rows are missing inside a range a pass needs. Never repaired
    /// here; upstream has to backfill.
    #[error("gaps in exported epochs between {from} and {to}: {gaps:?}")]
    Gap {
        from: u64,
        to: u64,
        gaps: Vec<EpochRange>,
    },
    #[error("rolling window {table} cannot bootstrap: tail bucket at epoch {epoch} is missing")]
    BootstrapPrereq { table: String, epoch: u64 },
    #[error("partition {name}: {source}")]
    Partition {
        name: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("partition name {name} does not encode a range")]
    PartitionName { name: String },
    #[error("invalid partition name pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid rollup configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{granularity} aggregation lock poisoned")]
    LockPoisoned { granularity: Granularity },
}

/// Attach the operation and range being processed to a store failure.
pub trait StoreContext<T> {
    fn context(self, context: &str) -> Result<T>;

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> StoreContext<T> for rusqlite::Result<T> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|source| RollupError::Store {
            context: context.to_string(),
            source,
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| RollupError::Store {
            context: f(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_context_wraps_source() {
        let failed: rusqlite::Result<()> = Err(rusqlite::Error::InvalidQuery);
        let err = failed
            .with_context(|| format!("merge hourly [{}, {})", 4, 8))
            .unwrap_err();

        assert!(err.to_string().starts_with("merge hourly [4, 8): "));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_gap_error_names_ranges() {
        let err = RollupError::Gap {
            from: 0,
            to: 10,
            gaps: vec![EpochRange::new(5, 6)],
        };
        assert_eq!(
            err.to_string(),
            "gaps in exported epochs between 0 and 10: [[5, 6)]"
        );
    }
}
