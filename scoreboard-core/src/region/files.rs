//! File capability used by the region manager.
//!
//! Production code goes through [`OsFilesFacade`]; tests substitute a
//! facade that refuses to allocate past a limit to exercise the
//! out-of-space paths.

use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// The OS primitives the scoreboard needs from its host.
pub trait FilesFacade: Send + Sync {
    /// Open the file read-write, creating it empty if missing.
    fn open_rw(&self, path: &Path) -> io::Result<File>;

    /// Current length of the file in bytes.
    fn length(&self, file: &File) -> io::Result<u64>;

    /// Reserve disk space so the file is at least `size` bytes long.
    ///
    /// Must fail rather than create a sparse tail: a mapped write into
    /// unreserved space would fault later instead of erroring here.
    fn allocate(&self, file: &File, size: u64) -> io::Result<()>;

    /// Map the first `len` bytes of the file read-write and shared.
    fn map(&self, file: &File, len: u64) -> io::Result<MmapMut>;

    /// Take an advisory exclusive lock on the file, blocking until granted.
    fn lock_exclusive(&self, file: &File) -> io::Result<()>;

    /// Release an advisory lock taken with [`FilesFacade::lock_exclusive`].
    fn unlock(&self, file: &File) -> io::Result<()>;
}

/// Real filesystem facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFilesFacade;

impl FilesFacade for OsFilesFacade {
    fn open_rw(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    fn length(&self, file: &File) -> io::Result<u64> {
        file.metadata().map(|m| m.len())
    }

    fn allocate(&self, file: &File, size: u64) -> io::Result<()> {
        if self.length(file)? >= size {
            return Ok(());
        }
        file.allocate(size)
    }

    fn map(&self, file: &File, len: u64) -> io::Result<MmapMut> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mapping too large"))?;
        // The file is shared with other processes; every field they can
        // mutate is only ever accessed through atomics.
        unsafe { MmapOptions::new().len(len).map_mut(file) }
    }

    fn lock_exclusive(&self, file: &File) -> io::Result<()> {
        FileExt::lock_exclusive(file)
    }

    fn unlock(&self, file: &File) -> io::Result<()> {
        FileExt::unlock(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_extends_and_never_shrinks() {
        let dir = tempdir().unwrap();
        let ff = OsFilesFacade;
        let file = ff.open_rw(&dir.path().join("f")).unwrap();
        assert_eq!(ff.length(&file).unwrap(), 0);

        ff.allocate(&file, 4096).unwrap();
        assert_eq!(ff.length(&file).unwrap(), 4096);

        ff.allocate(&file, 1024).unwrap();
        assert_eq!(ff.length(&file).unwrap(), 4096);
    }

    #[test]
    fn map_is_shared_between_mappings() {
        let dir = tempdir().unwrap();
        let ff = OsFilesFacade;
        let file = ff.open_rw(&dir.path().join("f")).unwrap();
        ff.allocate(&file, 128).unwrap();

        let mut a = ff.map(&file, 128).unwrap();
        let b = ff.map(&file, 128).unwrap();
        a[7] = 0xAB;
        assert_eq!(b[7], 0xAB);
    }
}
