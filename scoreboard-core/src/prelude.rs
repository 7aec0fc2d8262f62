//! Prelude for convenient imports.
//!
//! # Example
//!
//! ```ignore
//! use scoreboard_core::prelude::*;
//! ```

// Core types
pub use crate::types::{PartitionBy, PartitionTimestamp, Txn};

// Error handling
pub use crate::error::{Result, ScoreboardError};

// Scoreboard
pub use crate::config::ScoreboardConfig;
pub use crate::scoreboard::{Scoreboard, VersionState};

// File capability
pub use crate::region::{FilesFacade, OsFilesFacade};
