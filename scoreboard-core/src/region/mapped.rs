//! The mapped scoreboard file.

use super::files::FilesFacade;
use crate::error::{Result, ScoreboardError};
use memmap2::MmapMut;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Owner of the scoreboard file descriptor and its current mapping.
///
/// All access to the mapped bytes goes through bounds-checked accessors
/// that hand out atomics borrowed from `&self`, so a remap (which needs
/// `&mut self`) can never leave a caller holding a pointer into the old
/// mapping.
pub struct MappedRegion {
    files: Arc<dyn FilesFacade>,
    path: PathBuf,
    file: Option<File>,
    mmap: Option<MmapMut>,
    size: u64,
}

impl MappedRegion {
    /// Open or create the file at `path` and map it.
    ///
    /// A file shorter than `min_size` is first preallocated to `min_size`.
    /// On any failure everything acquired so far is released before the
    /// error is returned.
    pub fn open(files: Arc<dyn FilesFacade>, path: &Path, min_size: u64) -> Result<Self> {
        let path = path.to_path_buf();
        let file = files.open_rw(&path).map_err(|e| ScoreboardError::Open {
            path: path.clone(),
            cause: e.to_string(),
        })?;

        let len = files.length(&file).map_err(|e| ScoreboardError::Open {
            path: path.clone(),
            cause: e.to_string(),
        })?;

        let size = len.max(min_size);
        if size > len {
            files
                .allocate(&file, size)
                .map_err(|e| ScoreboardError::Capacity {
                    path: path.clone(),
                    requested: size,
                    cause: e.to_string(),
                })?;
        }

        let mmap = files.map(&file, size).map_err(|e| ScoreboardError::Mmap {
            path: path.clone(),
            cause: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), size, "Mapped scoreboard file");

        Ok(Self {
            files,
            path,
            file: Some(file),
            mmap: Some(mmap),
            size,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes currently mapped by this handle.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the region still holds its file and mapping.
    pub fn is_open(&self) -> bool {
        self.mmap.is_some()
    }

    /// Current length of the backing file, which may exceed [`Self::size`]
    /// when another handle grew it.
    pub fn file_len(&self) -> Result<u64> {
        let file = self.file.as_ref().ok_or(ScoreboardError::Closed)?;
        self.files.length(file).map_err(|e| ScoreboardError::Open {
            path: self.path.clone(),
            cause: e.to_string(),
        })
    }

    /// Make sure at least `required` bytes are mapped.
    ///
    /// If the file is already long enough (another handle grew it) this is
    /// a plain remap. Otherwise the file is preallocated to twice the
    /// required size and remapped. When allocation or mapping fails the
    /// region keeps its previous file length accounting and mapping.
    pub fn ensure_capacity(&mut self, required: u64) -> Result<()> {
        if required <= self.size {
            return Ok(());
        }
        let file_len = self.file_len()?;
        if file_len >= required {
            return self.remap(file_len);
        }

        let new_size = required.saturating_mul(2);
        let file = self.file.as_ref().ok_or(ScoreboardError::Closed)?;
        self.files
            .allocate(file, new_size)
            .map_err(|e| ScoreboardError::Capacity {
                path: self.path.clone(),
                requested: new_size,
                cause: e.to_string(),
            })?;

        tracing::info!(
            path = %self.path.display(),
            old_size = self.size,
            new_size,
            "Grew scoreboard file"
        );
        self.remap(new_size)
    }

    fn remap(&mut self, new_size: u64) -> Result<()> {
        let file = self.file.as_ref().ok_or(ScoreboardError::Closed)?;
        let mmap = self
            .files
            .map(file, new_size)
            .map_err(|e| ScoreboardError::Mmap {
                path: self.path.clone(),
                cause: e.to_string(),
            })?;
        // Old mapping is unmapped here, only after the new one exists.
        self.mmap = Some(mmap);
        self.size = new_size;
        Ok(())
    }

    /// Borrow an 8-byte aligned word of the mapping as an atomic.
    ///
    /// # Panics
    ///
    /// Panics if the region is closed, or if `offset` is misaligned or out
    /// of the mapped range. Callers validate slot indices before computing
    /// offsets, so either case is a bug.
    pub fn atomic_u64(&self, offset: u64) -> &AtomicU64 {
        let mmap = self
            .mmap
            .as_ref()
            .expect("scoreboard region accessed after close");
        assert!(offset % 8 == 0, "misaligned scoreboard offset {offset}");
        assert!(
            offset + 8 <= self.size,
            "scoreboard offset {offset} beyond mapped size {}",
            self.size
        );
        // The mapping is page aligned and `offset` is 8-aligned and in
        // bounds. Every word that other handles mutate is only accessed
        // atomically, and the reference cannot outlive `&self`.
        unsafe { &*(mmap.as_ptr().add(offset as usize) as *const AtomicU64) }
    }

    /// Read `len` bytes at `offset`. Only used for immutable header fields.
    pub fn read_bytes(&self, offset: u64, len: usize) -> &[u8] {
        let mmap = self
            .mmap
            .as_ref()
            .expect("scoreboard region accessed after close");
        let start = offset as usize;
        &mmap[start..start + len]
    }

    /// Overwrite bytes at `offset`. Only used while the file is being
    /// initialized under the advisory file lock.
    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mmap = self.mmap.as_mut().ok_or(ScoreboardError::Closed)?;
        let start = offset as usize;
        mmap[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Take the advisory exclusive file lock, released when the guard drops.
    pub fn lock_file(&self) -> Result<FileLock> {
        let file = self.file.as_ref().ok_or(ScoreboardError::Closed)?;
        let file = file.try_clone().map_err(|e| ScoreboardError::Open {
            path: self.path.clone(),
            cause: e.to_string(),
        })?;
        self.files
            .lock_exclusive(&file)
            .map_err(|e| ScoreboardError::Open {
                path: self.path.clone(),
                cause: format!("Failed to lock file: {}", e),
            })?;
        Ok(FileLock {
            files: Arc::clone(&self.files),
            file,
        })
    }

    /// Flush the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        let mmap = self.mmap.as_ref().ok_or(ScoreboardError::Closed)?;
        mmap.flush().map_err(|e| ScoreboardError::Mmap {
            path: self.path.clone(),
            cause: e.to_string(),
        })
    }

    /// Unmap and close. Safe to call repeatedly; failures are logged.
    pub fn close(&mut self, sync: bool) {
        if let Some(mmap) = self.mmap.take() {
            if sync {
                if let Err(e) = mmap.flush() {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Failed to flush scoreboard"
                    );
                }
            }
        }
        if self.file.take().is_some() {
            tracing::debug!(path = %self.path.display(), "Closed scoreboard file");
        }
        self.size = 0;
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.close(false);
    }
}

/// Advisory exclusive lock on the scoreboard file.
pub struct FileLock {
    files: Arc<dyn FilesFacade>,
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.files.unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to unlock scoreboard file");
        }
    }
}
