//! Scoreboard configuration.

use crate::types::PartitionBy;
use serde::{Deserialize, Serialize};

/// Conventional name of the scoreboard file inside a table directory.
pub const DEFAULT_FILE_NAME: &str = "scoreboard.d";

/// Default number of busy-wait iterations before the header lock yields.
pub const DEFAULT_HEADER_LOCK_SPINS: u32 = 64;

/// Configuration for opening or creating a scoreboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreboardConfig {
    /// File name of the scoreboard inside the table directory.
    pub file_name: String,
    /// Partitioning policy of the owning table.
    ///
    /// Only consulted when the file is created: unpartitioned tables get
    /// their single synthetic partition seeded up front.
    pub partition_by: PartitionBy,
    /// Busy-wait iterations on the header lock before yielding the thread.
    pub header_lock_spins: u32,
    /// Whether to flush the mapping to disk when the handle is closed.
    pub sync_on_close: bool,
}

impl Default for ScoreboardConfig {
    fn default() -> Self {
        Self {
            file_name: DEFAULT_FILE_NAME.to_string(),
            partition_by: PartitionBy::None,
            header_lock_spins: DEFAULT_HEADER_LOCK_SPINS,
            sync_on_close: false,
        }
    }
}

impl ScoreboardConfig {
    /// Set the partitioning policy.
    pub fn with_partition_by(mut self, partition_by: PartitionBy) -> Self {
        self.partition_by = partition_by;
        self
    }

    /// Set the scoreboard file name.
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Set the header lock spin count. Zero yields on every failed attempt.
    pub fn with_header_lock_spins(mut self, spins: u32) -> Self {
        self.header_lock_spins = spins;
        self
    }

    /// Flush the mapping when the handle is closed.
    pub fn with_sync_on_close(mut self, sync: bool) -> Self {
        self.sync_on_close = sync;
        self
    }
}
