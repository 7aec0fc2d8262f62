//! Transaction scoreboard.
//!
//! A columnar table rewrites partitions out of place (merge, dedup, column
//! add), so several on-disk versions of a partition can exist at once. A
//! version may only be deleted once nobody reads it any more. The
//! scoreboard answers "is anyone still reading version V of partition P?"
//! and arbitrates exclusive access for writers.
//!
//! # Key Components
//!
//! - **Region**: the memory-mapped `scoreboard.d` file; grows, never shrinks
//! - **Slot table**: one slot per partition, each tracking a bounded set of
//!   versions (txns)
//! - **Protocol**: per-version reader counts and write locks as atomics in
//!   the mapping, plus a header lock guarding slot table changes
//! - **Scoreboard**: the handle the storage engine calls
//!
//! Because all lock state lives in the mapped file, every process that maps
//! the same file shares it.
//!
//! # Example
//!
//! ```ignore
//! use scoreboard_core::prelude::*;
//!
//! let sb = Scoreboard::open(table_dir, ScoreboardConfig::default())?;
//! let ts = PartitionTimestamp::NONE;
//!
//! if sb.acquire_read_lock(ts, Txn::new(5))? {
//!     // ... scan version 5 ...
//!     sb.release_read_lock(ts, Txn::new(5))?;
//! }
//!
//! // Vacuum: only delete a superseded version nobody reads.
//! if sb.access_counter(ts, Txn::new(4))? == 0 && sb.remove_partition(ts, Txn::new(4))? {
//!     delete_version_files(ts, Txn::new(4));
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod board;
pub mod config;
pub mod error;
pub mod prelude;
pub mod region;
pub mod scoreboard;
pub mod types;

pub use config::ScoreboardConfig;
pub use error::{Result, ScoreboardError};
pub use region::{FilesFacade, OsFilesFacade};
pub use scoreboard::{Scoreboard, VersionState};
pub use types::{PartitionBy, PartitionTimestamp, Txn};
