//! Strongly-typed identifiers for partitions and their versions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a partition by the start of its time interval.
///
/// Tables that are not partitioned use a single synthetic partition with
/// timestamp zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionTimestamp(i64);

impl PartitionTimestamp {
    /// The partition of a non-partitioned table.
    pub const NONE: Self = Self(0);

    /// Create a new partition timestamp.
    #[must_use]
    pub const fn new(ts: i64) -> Self {
        Self(ts)
    }

    /// Get the raw timestamp value.
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PartitionTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PartitionTimestamp {
    fn from(ts: i64) -> Self {
        Self(ts)
    }
}

/// Commit sequence number of a partition version.
///
/// Every out-of-place rewrite of a partition (merge, dedup, column add)
/// produces a new version tagged with the txn that committed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Txn(u64);

impl Txn {
    /// Largest txn that can be tracked; the on-disk key reserves zero for
    /// "free entry" and stores `txn + 1`.
    pub const MAX: Self = Self(u64::MAX - 1);

    /// Create a new txn.
    #[must_use]
    pub const fn new(txn: u64) -> Self {
        Self(txn)
    }

    /// Get the raw sequence number.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Encode as a version entry key. Zero is never produced.
    pub(crate) fn to_key(self) -> u64 {
        assert!(self <= Self::MAX, "txn {} cannot be tracked", self.0);
        self.0 + 1
    }

    /// Decode a non-zero version entry key.
    pub(crate) fn from_key(key: u64) -> Option<Self> {
        key.checked_sub(1).map(Self)
    }
}

impl fmt::Display for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Txn {
    fn from(txn: u64) -> Self {
        Self(txn)
    }
}
