//! Immutable prefix of the scoreboard header.
//!
//! The first 16 bytes are written once when the file is initialized and
//! never change afterwards. The remaining header words are atomics owned by
//! the slot table and lock protocol.

use super::layout::{self, LAYOUT_VERSION, MAGIC, VERSIONS_PER_SLOT};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Size of the immutable prefix in bytes.
pub const PREFIX_SIZE: usize = 16;

/// The immutable part of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreboardHeader {
    /// Magic number for file identification.
    pub magic: u64,
    /// Layout version.
    pub version: u32,
    /// Version entries per partition slot.
    pub versions_per_slot: u32,
}

impl Default for ScoreboardHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoreboardHeader {
    /// Create the header for the current layout.
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: LAYOUT_VERSION,
            versions_per_slot: VERSIONS_PER_SLOT as u32,
        }
    }

    /// Whether these bytes were never initialized.
    pub fn is_blank(&self) -> bool {
        self.magic == 0 && self.version == 0 && self.versions_per_slot == 0
    }

    /// Validate the header against this build's layout.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.magic != MAGIC {
            return Err("Invalid magic number");
        }
        if self.version != LAYOUT_VERSION {
            return Err("Unsupported scoreboard layout version");
        }
        if self.versions_per_slot as usize != VERSIONS_PER_SLOT {
            return Err("Mismatched version entries per slot");
        }
        Ok(())
    }

    /// Read the prefix from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < PREFIX_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Buffer too small for header",
            ));
        }
        let mut cursor = io::Cursor::new(bytes);
        let magic = cursor.read_u64::<LittleEndian>()?;
        let version = cursor.read_u32::<LittleEndian>()?;
        let versions_per_slot = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            magic,
            version,
            versions_per_slot,
        })
    }

    /// Write the prefix to a byte buffer.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(PREFIX_SIZE);
        buf.write_u64::<LittleEndian>(self.magic)?;
        buf.write_u32::<LittleEndian>(self.version)?;
        buf.write_u32::<LittleEndian>(self.versions_per_slot)?;
        debug_assert_eq!(buf.len(), PREFIX_SIZE);
        Ok(buf)
    }
}

const _: () = assert!(layout::header::PARTITION_COUNT as usize == PREFIX_SIZE);
