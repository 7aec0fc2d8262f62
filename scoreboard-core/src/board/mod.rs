//! The scoreboard file contents: header, partition slot table, and the
//! lock/counter protocol that runs on them.
//!
//! Everything here operates on a borrowed [`MappedRegion`]; callers hold
//! the handle's region lock while a view is alive, so no view survives a
//! remap.
//!
//! [`MappedRegion`]: crate::region::MappedRegion

pub mod header;
pub mod layout;
pub mod protocol;
pub mod slots;

pub use header::ScoreboardHeader;
pub use layout::{scoreboard_size, HEADER_SIZE, SLOT_SIZE, VERSIONS_PER_SLOT};
pub use protocol::HeaderLockGuard;
pub use slots::{Claim, Slot, SlotTable, VersionEntry};
