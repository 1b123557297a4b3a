//! Value types shared by the rollup components

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open epoch range `[from, to)`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpochRange {
    pub from: u64,
    pub to: u64,
}

impl EpochRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from)
    }

    pub fn contains(&self, epoch: u64) -> bool {
        self.from <= epoch && epoch < self.to
    }

    /// Last epoch inside the range (the inclusive form merge callers log)
    pub fn last(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.to - 1)
        }
    }

    /// Collapse a sorted list of epochs into contiguous ranges
    pub fn collapse(epochs: &[u64]) -> Vec<EpochRange> {
        let mut ranges: Vec<EpochRange> = Vec::new();
        for &epoch in epochs {
            match ranges.last_mut() {
                Some(range) if range.to == epoch => range.to = epoch + 1,
                _ => ranges.push(EpochRange::new(epoch, epoch + 1)),
            }
        }
        ranges
    }
}

impl fmt::Display for EpochRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

impl fmt::Debug for EpochRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Range of the most recent bucket row set of a bucket table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedBucket {
    /// Bucket start (inclusive)
    pub epoch_start: u64,
    /// First epoch not yet merged into the bucket
    pub epoch_end: u64,
}

/// Result of one advancement pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationOutcome {
    /// Source ranges merged, one per touched bucket
    pub merged: Vec<EpochRange>,
    /// Buckets left alone because they were already closed
    pub closed_skipped: usize,
    /// Set when the catch-up guard refused to run; holds the lag in epochs
    pub behind_by: Option<u64>,
    /// Rolling window after the pass
    pub rolling_window: Option<EpochRange>,
}

impl AggregationOutcome {
    pub fn behind(lag: u64) -> Self {
        Self {
            behind_by: Some(lag),
            ..Self::default()
        }
    }

    pub fn buckets_written(&self) -> usize {
        self.merged.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_epochs() {
        let ranges = EpochRange::collapse(&[3, 4, 5, 9, 11, 12]);
        assert_eq!(
            ranges,
            vec![
                EpochRange::new(3, 6),
                EpochRange::new(9, 10),
                EpochRange::new(11, 13)
            ]
        );
        assert!(EpochRange::collapse(&[]).is_empty());
    }

    #[test]
    fn test_range_last_is_inclusive_end() {
        assert_eq!(EpochRange::new(4, 8).last(), Some(7));
        assert_eq!(EpochRange::new(8, 8).last(), None);
        assert_eq!(EpochRange::new(4, 8).len(), 4);
    }
}
