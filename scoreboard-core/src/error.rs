//! Error types for the scoreboard.
//!
//! Resource and capacity failures are returned as [`ScoreboardError`] and
//! carry the path of the backing file so the caller can report them.
//! Protocol violations (unbalanced acquire/release) are bugs in the caller
//! and panic instead of being returned.

use crate::types::PartitionTimestamp;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for scoreboard operations.
#[derive(Error, Debug)]
pub enum ScoreboardError {
    // =========================================================================
    // Backing file errors (S001-S099)
    // =========================================================================
    /// Failed to open, create or lock the scoreboard file.
    #[error("S001: Failed to open scoreboard at {}: {cause}", path.display())]
    Open {
        /// The path of the scoreboard file.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// Failed to memory-map the scoreboard file.
    #[error("S002: Failed to mmap scoreboard at {}: {cause}", path.display())]
    Mmap {
        /// The path of the scoreboard file.
        path: PathBuf,
        /// Reason for the mmap failure.
        cause: String,
    },

    /// The file could not be preallocated to the requested size.
    #[error(
        "S003: Could not grow scoreboard at {} to {requested} bytes: {cause}",
        path.display()
    )]
    Capacity {
        /// The path of the scoreboard file.
        path: PathBuf,
        /// Requested file size in bytes.
        requested: u64,
        /// Reason reported by the OS.
        cause: String,
    },

    /// The header does not describe a scoreboard this build understands.
    #[error("S004: Scoreboard corruption detected at {}: {cause}", path.display())]
    Corruption {
        /// The path of the scoreboard file.
        path: PathBuf,
        /// Description of the corruption.
        cause: String,
    },

    // =========================================================================
    // Slot table errors (S100-S199)
    // =========================================================================
    /// Every version entry of a partition slot is in use.
    #[error("S101: All {capacity} version entries of partition {ts} are in use")]
    VersionsExhausted {
        /// The partition whose slot is full.
        ts: PartitionTimestamp,
        /// Number of version entries per slot.
        capacity: usize,
    },

    /// The handle has already been closed.
    #[error("S102: Scoreboard handle is closed")]
    Closed,
}

impl ScoreboardError {
    /// Get the error code (e.g., "S001").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Open { .. } => "S001",
            Self::Mmap { .. } => "S002",
            Self::Capacity { .. } => "S003",
            Self::Corruption { .. } => "S004",
            Self::VersionsExhausted { .. } => "S101",
            Self::Closed => "S102",
        }
    }

    /// Check if the caller may reasonably retry the operation later.
    ///
    /// Space may be freed on the device, and pinned version entries are
    /// released as readers finish.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Capacity { .. } | Self::VersionsExhausted { .. }
        )
    }
}

/// Result type alias for scoreboard operations.
pub type Result<T> = std::result::Result<T, ScoreboardError>;
