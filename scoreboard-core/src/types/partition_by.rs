//! Partitioning policy of the table that owns a scoreboard.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the owning table splits its rows into partitions.
///
/// The scoreboard only cares whether the table is partitioned at all: a
/// table with [`PartitionBy::None`] has exactly one synthetic partition,
/// seeded when the scoreboard file is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    /// Not partitioned.
    #[default]
    None,
    /// One partition per hour.
    Hour,
    /// One partition per day.
    Day,
    /// One partition per week.
    Week,
    /// One partition per month.
    Month,
    /// One partition per year.
    Year,
}

impl PartitionBy {
    /// Number of partitions seeded into a freshly created scoreboard.
    #[must_use]
    pub fn initial_partition_count(self) -> u64 {
        match self {
            Self::None => 1,
            _ => 0,
        }
    }

    /// Whether the table is split into multiple partitions.
    #[must_use]
    pub fn is_partitioned(self) -> bool {
        self != Self::None
    }
}

impl fmt::Display for PartitionBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Hour => "HOUR",
            Self::Day => "DAY",
            Self::Week => "WEEK",
            Self::Month => "MONTH",
            Self::Year => "YEAR",
        };
        f.write_str(name)
    }
}
