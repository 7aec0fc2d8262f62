//! Byte layout of the scoreboard file.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (64 B)                                                │
//! │  magic | version | versions/slot | partition count |         │
//! │  slot high water | header lock | generation | active readers │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Slot 0 (256 B)                                               │
//! │  state | partition ts | claim lock | reserved                │
//! │  entry 0: [txn key: u64][lock word: u64]                     │
//! │  ...                                                         │
//! │  entry 13                                                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Slot 1 ...                                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All words are little-endian `u64`, 8-byte aligned. The file may be longer
//! than the slots in use.

/// Magic number identifying a scoreboard file ("SCOREBRD").
pub const MAGIC: u64 = u64::from_le_bytes(*b"SCOREBRD");

/// Current layout version.
pub const LAYOUT_VERSION: u32 = 1;

/// Fixed size of the header in bytes.
pub const HEADER_SIZE: u64 = 64;

/// Version entries tracked per partition slot.
pub const VERSIONS_PER_SLOT: usize = 14;

/// Size of one version entry.
pub const ENTRY_SIZE: u64 = 16;

/// Size of the fixed part of a slot, before its entries.
pub const SLOT_PREFIX_SIZE: u64 = 32;

/// Size of one partition slot.
pub const SLOT_SIZE: u64 = SLOT_PREFIX_SIZE + VERSIONS_PER_SLOT as u64 * ENTRY_SIZE;

/// Header field offsets.
pub mod header {
    /// `u64` magic.
    pub const MAGIC: u64 = 0;
    /// `u32` layout version.
    pub const VERSION: u64 = 8;
    /// `u32` version entries per slot.
    pub const VERSIONS_PER_SLOT: u64 = 12;
    /// `u64` number of live partitions.
    pub const PARTITION_COUNT: u64 = 16;
    /// `u64` number of slot positions ever used.
    pub const SLOT_HIGH_WATER: u64 = 24;
    /// `u64` structural lock word, 0 when free.
    pub const HEADER_LOCK: u64 = 32;
    /// `u64` generation stamp.
    pub const GENERATION: u64 = 40;
    /// `u64` read locks held across all slots.
    pub const ACTIVE_READERS: u64 = 48;
}

/// Slot field offsets, relative to the slot start.
pub mod slot {
    /// `u64` slot state, one of the `SLOT_*` constants.
    pub const STATE: u64 = 0;
    /// `i64` partition timestamp.
    pub const TIMESTAMP: u64 = 8;
    /// `u64` lock serializing entry claims and eviction.
    pub const CLAIM_LOCK: u64 = 16;
    /// First version entry.
    pub const ENTRIES: u64 = 32;
}

/// Version entry field offsets, relative to the entry start.
pub mod entry {
    /// `u64` encoded txn, 0 when the entry is free.
    pub const KEY: u64 = 0;
    /// `u64` lock word.
    pub const LOCK: u64 = 8;
}

/// Slot position never used.
pub const SLOT_FREE: u64 = 0;
/// Slot tracks a partition.
pub const SLOT_LIVE: u64 = 1;
/// Slot's partition was removed; the position may be reused.
pub const SLOT_RETIRED: u64 = 2;

/// Lock word: reader count in the low 48 bits.
pub const READER_MASK: u64 = (1 << 48) - 1;
/// Lock word: exclusive writer present.
pub const WRITE_BIT: u64 = 1 << 62;
/// Lock word: entry is being evicted or removed.
pub const RECLAIM_BIT: u64 = 1 << 63;

/// File size needed to hold `partition_count` slots.
#[must_use]
pub const fn scoreboard_size(partition_count: u64) -> u64 {
    HEADER_SIZE + partition_count * SLOT_SIZE
}

/// Offset of slot `index`.
#[must_use]
pub const fn slot_offset(index: u64) -> u64 {
    HEADER_SIZE + index * SLOT_SIZE
}

/// Offset of version entry `entry` within slot `index`.
#[must_use]
pub const fn entry_offset(index: u64, entry: usize) -> u64 {
    slot_offset(index) + slot::ENTRIES + entry as u64 * ENTRY_SIZE
}

/// Number of whole slots that fit in `mapped_size` bytes.
#[must_use]
pub const fn slot_capacity(mapped_size: u64) -> u64 {
    mapped_size.saturating_sub(HEADER_SIZE) / SLOT_SIZE
}
