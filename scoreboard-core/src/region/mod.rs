//! Shared region manager.
//!
//! Owns the scoreboard file and its read-write shared mapping. The region
//! only ever grows: growth preallocates the file (failing cleanly when the
//! device is full) and then remaps, leaving the old mapping in place if
//! either step fails.

mod files;
mod mapped;

pub use files::{FilesFacade, OsFilesFacade};
pub use mapped::{FileLock, MappedRegion};
