//! Shared helpers for scoreboard integration tests.

#![allow(dead_code)]

use scoreboard_core::{FilesFacade, OsFilesFacade, PartitionTimestamp, Txn};
use std::fs::File;
use std::io;
use std::path::Path;

pub fn ts(v: i64) -> PartitionTimestamp {
    PartitionTimestamp::new(v)
}

pub fn txn(v: u64) -> Txn {
    Txn::new(v)
}

/// Files facade that reports a full device once a file would grow past
/// `limit` bytes.
pub struct LimitedFiles {
    pub limit: u64,
}

impl FilesFacade for LimitedFiles {
    fn open_rw(&self, path: &Path) -> io::Result<File> {
        OsFilesFacade.open_rw(path)
    }

    fn length(&self, file: &File) -> io::Result<u64> {
        OsFilesFacade.length(file)
    }

    fn allocate(&self, file: &File, size: u64) -> io::Result<()> {
        if size > self.limit {
            return Err(io::Error::new(io::ErrorKind::Other, "No space left on device"));
        }
        OsFilesFacade.allocate(file, size)
    }

    fn map(&self, file: &File, len: u64) -> io::Result<memmap2::MmapMut> {
        OsFilesFacade.map(file, len)
    }

    fn lock_exclusive(&self, file: &File) -> io::Result<()> {
        OsFilesFacade.lock_exclusive(file)
    }

    fn unlock(&self, file: &File) -> io::Result<()> {
        OsFilesFacade.unlock(file)
    }
}
