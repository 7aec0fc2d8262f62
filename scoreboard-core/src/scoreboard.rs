//! The scoreboard handle used by the rest of the storage engine.

use crate::board::header::{ScoreboardHeader, PREFIX_SIZE};
use crate::board::layout::{scoreboard_size, HEADER_SIZE};
use crate::board::protocol::{self, HeaderLockGuard};
use crate::board::slots::{Claim, SlotTable};
use crate::config::ScoreboardConfig;
use crate::error::{Result, ScoreboardError};
use crate::region::{FilesFacade, MappedRegion, OsFilesFacade};
use crate::types::{PartitionTimestamp, Txn};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lock state of one registered partition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionState {
    /// The version's commit sequence number.
    pub txn: Txn,
    /// Readers currently attached.
    pub readers: u64,
    /// Whether a writer holds the version.
    pub write_locked: bool,
}

/// A handle onto a scoreboard file.
///
/// The handle is `Sync`: threads share it and take the local `RwLock` in
/// read mode for every lock operation, so they only contend on the atomics
/// in the mapping. Growing the local mapping takes the `RwLock` in write
/// mode. Other processes open their own handle onto the same file.
///
/// # Example
///
/// ```ignore
/// let sb = Scoreboard::open(table_dir, ScoreboardConfig::default())?;
/// let (ts, txn) = (PartitionTimestamp::NONE, Txn::new(5));
/// if sb.acquire_read_lock(ts, txn)? {
///     scan_partition(ts, txn);
///     sb.release_read_lock(ts, txn)?;
/// }
/// ```
pub struct Scoreboard {
    region: RwLock<MappedRegion>,
    config: ScoreboardConfig,
    path: PathBuf,
}

impl Scoreboard {
    /// Open the scoreboard in `dir`, creating and initializing the file if
    /// it does not exist yet.
    pub fn open(dir: impl AsRef<Path>, config: ScoreboardConfig) -> Result<Self> {
        Self::open_with(Arc::new(OsFilesFacade), dir, config)
    }

    /// Open through a custom file facade.
    pub fn open_with(
        files: Arc<dyn FilesFacade>,
        dir: impl AsRef<Path>,
        config: ScoreboardConfig,
    ) -> Result<Self> {
        let path = dir.as_ref().join(&config.file_name);
        let mut region = MappedRegion::open(files, &path, HEADER_SIZE)?;
        initialize(&mut region, &config)?;

        let used = SlotTable::new(&region, config.header_lock_spins).slot_count();
        region.ensure_capacity(scoreboard_size(used))?;

        tracing::debug!(
            path = %path.display(),
            size = region.size(),
            slots = used,
            "Opened scoreboard"
        );

        Ok(Self {
            region: RwLock::new(region),
            config,
            path,
        })
    }

    /// Create and initialize the scoreboard file in `dir`, then release it.
    ///
    /// Unpartitioned tables get their single partition `(0, txn 0)` seeded.
    /// An already initialized file is validated and left unchanged.
    pub fn create(dir: impl AsRef<Path>, config: ScoreboardConfig) -> Result<()> {
        Self::create_with(Arc::new(OsFilesFacade), dir, config)
    }

    /// Create through a custom file facade.
    pub fn create_with(
        files: Arc<dyn FilesFacade>,
        dir: impl AsRef<Path>,
        config: ScoreboardConfig,
    ) -> Result<()> {
        let scoreboard = Self::open_with(files, dir, config)?;
        scoreboard.close();
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration this handle was opened with.
    pub fn config(&self) -> &ScoreboardConfig {
        &self.config
    }

    /// Bytes mapped by this handle; zero once closed.
    pub fn mapped_size(&self) -> u64 {
        self.region.read().size()
    }

    /// Whether the handle is still open.
    pub fn is_open(&self) -> bool {
        self.region.read().is_open()
    }

    /// Register a reader of version `txn` of partition `ts`.
    ///
    /// Returns false when the partition is not tracked or a writer holds
    /// that version; nothing is registered and nothing must be released.
    /// Every `true` must be paired with exactly one
    /// [`Scoreboard::release_read_lock`], on every exit path.
    pub fn acquire_read_lock(&self, ts: PartitionTimestamp, txn: Txn) -> Result<bool> {
        tracing::debug!(ts = %ts, txn = %txn, path = %self.path.display(), "acquire read lock");
        self.with_current_table(|table| protocol::acquire_read_lock(table, ts, txn))
    }

    /// Release a reader registered with [`Scoreboard::acquire_read_lock`].
    ///
    /// # Panics
    ///
    /// Panics if no such reader is registered.
    pub fn release_read_lock(&self, ts: PartitionTimestamp, txn: Txn) -> Result<()> {
        tracing::debug!(ts = %ts, txn = %txn, path = %self.path.display(), "release read lock");
        self.with_current_table(|table| {
            protocol::release_read_lock(table, ts, txn);
            Ok(())
        })
    }

    /// Try to lock version `txn` of partition `ts` exclusively.
    ///
    /// Fails fast with false if the version has readers or another writer;
    /// retry policy is up to the caller.
    pub fn acquire_write_lock(&self, ts: PartitionTimestamp, txn: Txn) -> Result<bool> {
        tracing::debug!(ts = %ts, txn = %txn, path = %self.path.display(), "acquire write lock");
        self.with_current_table(|table| protocol::acquire_write_lock(table, ts, txn))
    }

    /// Release a write lock.
    ///
    /// # Panics
    ///
    /// Panics if the version is not write-locked.
    pub fn release_write_lock(&self, ts: PartitionTimestamp, txn: Txn) -> Result<()> {
        tracing::debug!(ts = %ts, txn = %txn, path = %self.path.display(), "release write lock");
        self.with_current_table(|table| {
            protocol::release_write_lock(table, ts, txn);
            Ok(())
        })
    }

    /// Start tracking version `txn` of partition `ts`.
    ///
    /// Grows the file when a new slot is needed. Returns false if the
    /// version is already tracked. On a capacity error the slot table is
    /// left as it was.
    pub fn add_partition(&self, ts: PartitionTimestamp, txn: Txn) -> Result<bool> {
        let spins = self.config.header_lock_spins;
        let mut region = self.region.write();
        if !region.is_open() {
            return Err(ScoreboardError::Closed);
        }
        let mut guard = HeaderLockGuard::acquire(&mut region, spins);

        let used = SlotTable::new(&guard, spins).slot_count();
        guard.ensure_capacity(scoreboard_size(used))?;

        let next = {
            let table = SlotTable::new(&guard, spins);
            if let Some(index) = table.index_of(ts) {
                let added = match table.claim(index, ts, txn)? {
                    Claim::Claimed(_) => true,
                    // Slots only retire under the header lock.
                    Claim::Found(_) | Claim::SlotGone => false,
                };
                tracing::debug!(ts = %ts, txn = %txn, added, "add partition version");
                return Ok(added);
            }
            table.next_position()
        };

        guard.ensure_capacity(scoreboard_size(next + 1))?;
        let index = SlotTable::new(&guard, spins).append_slot(ts, txn);
        tracing::debug!(
            ts = %ts,
            txn = %txn,
            slot = index,
            path = %self.path.display(),
            "add partition"
        );
        Ok(true)
    }

    /// Stop tracking version `txn` of partition `ts`.
    ///
    /// Returns false if the version is not tracked or is still locked by a
    /// reader or writer. Removing the last version of a partition frees its
    /// slot for reuse.
    pub fn remove_partition(&self, ts: PartitionTimestamp, txn: Txn) -> Result<bool> {
        let spins = self.config.header_lock_spins;
        let mut region = self.region.write();
        if !region.is_open() {
            return Err(ScoreboardError::Closed);
        }
        let mut guard = HeaderLockGuard::acquire(&mut region, spins);

        let used = SlotTable::new(&guard, spins).slot_count();
        guard.ensure_capacity(scoreboard_size(used))?;

        let removed = SlotTable::new(&guard, spins).remove_slot(ts, txn);
        tracing::debug!(
            ts = %ts,
            txn = %txn,
            removed,
            path = %self.path.display(),
            "remove partition"
        );
        Ok(removed)
    }

    /// Readers currently attached to (ts, txn). A snapshot, not a lock.
    pub fn access_counter(&self, ts: PartitionTimestamp, txn: Txn) -> Result<u64> {
        self.with_current_table(|table| Ok(protocol::access_counter(table, ts, txn)))
    }

    /// Read locks held anywhere in the scoreboard, by any handle.
    ///
    /// Non-zero after all scans finished means a reader leaked.
    pub fn active_reader_counter(&self) -> Result<u64> {
        self.with_current_table(|table| Ok(protocol::active_reader_counter(table)))
    }

    /// Number of tracked partitions.
    pub fn partition_count(&self) -> Result<u64> {
        self.with_current_table(|table| Ok(table.partition_count()))
    }

    /// Slot index of partition `ts`, if version `txn` is tracked in it.
    pub fn partition_index(&self, ts: PartitionTimestamp, txn: Txn) -> Result<Option<u64>> {
        self.with_current_table(|table| Ok(protocol::partition_index(table, ts, txn)))
    }

    /// Generation stamp; changes on every structural edit.
    pub fn header_access_counter(&self) -> Result<u64> {
        self.with_current_table(|table| Ok(table.generation()))
    }

    /// Whether a writer holds (ts, txn).
    pub fn is_write_locked(&self, ts: PartitionTimestamp, txn: Txn) -> Result<bool> {
        self.with_current_table(|table| Ok(protocol::is_write_locked(table, ts, txn)))
    }

    /// Versions tracked for partition `ts`, in entry order.
    pub fn partition_versions(&self, ts: PartitionTimestamp) -> Result<Vec<VersionState>> {
        self.with_current_table(|table| {
            let Some(index) = table.index_of(ts) else {
                return Ok(Vec::new());
            };
            Ok(table
                .slot(index)
                .entries()
                .filter_map(|e| {
                    e.txn().map(|txn| VersionState {
                        txn,
                        readers: e.readers(),
                        write_locked: e.is_write_locked(),
                    })
                })
                .collect())
        })
    }

    /// Unmap and close. Idempotent; later calls return
    /// [`ScoreboardError::Closed`].
    pub fn close(&self) {
        let mut region = self.region.write();
        if region.is_open() {
            region.close(self.config.sync_on_close);
            tracing::debug!(path = %self.path.display(), "Closed scoreboard");
        }
    }

    /// Run `f` against a mapping that covers every used slot.
    ///
    /// If another handle appended slots beyond this handle's mapping, the
    /// mapping is extended first. That is a local remap only and does not
    /// take the header lock.
    fn with_current_table<T>(&self, f: impl FnOnce(&SlotTable<'_>) -> Result<T>) -> Result<T> {
        let spins = self.config.header_lock_spins;
        {
            let region = self.region.read();
            if !region.is_open() {
                return Err(ScoreboardError::Closed);
            }
            let table = SlotTable::new(&region, spins);
            if table.slot_count() <= table.capacity() {
                return f(&table);
            }
        }

        let mut region = self.region.write();
        if !region.is_open() {
            return Err(ScoreboardError::Closed);
        }
        let used = SlotTable::new(&region, spins).slot_count();
        region.ensure_capacity(scoreboard_size(used))?;
        let region = parking_lot::RwLockWriteGuard::downgrade(region);
        f(&SlotTable::new(&region, spins))
    }
}

impl Drop for Scoreboard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write the header of a blank file, or validate an existing one.
///
/// Runs under the advisory file lock so concurrent openers of a new file
/// initialize it exactly once.
fn initialize(region: &mut MappedRegion, config: &ScoreboardConfig) -> Result<()> {
    let _lock = region.lock_file()?;
    let path = region.path().to_path_buf();
    let corruption = |cause: String| ScoreboardError::Corruption {
        path: path.clone(),
        cause,
    };

    let header = ScoreboardHeader::from_bytes(region.read_bytes(0, PREFIX_SIZE))
        .map_err(|e| corruption(e.to_string()))?;
    if !header.is_blank() {
        return header.validate().map_err(|e| corruption(e.to_string()));
    }

    // A blank header means no opener ever finished initializing; discard
    // anything a crashed one left behind.
    let size = region.size() as usize;
    region.write_bytes(0, &vec![0u8; size])?;

    let seeded = config.partition_by.initial_partition_count();
    if seeded > 0 {
        region.ensure_capacity(scoreboard_size(seeded))?;
        let guard = HeaderLockGuard::acquire(region, config.header_lock_spins);
        SlotTable::new(&guard, config.header_lock_spins)
            .append_slot(PartitionTimestamp::NONE, Txn::new(0));
    }

    // Publishing the magic last marks the file initialized.
    let bytes = ScoreboardHeader::new()
        .to_bytes()
        .map_err(|e| corruption(e.to_string()))?;
    region.write_bytes(0, &bytes)?;

    tracing::info!(
        path = %path.display(),
        partition_by = %config.partition_by,
        "Created scoreboard"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionBy;
    use tempfile::tempdir;

    fn ts(v: i64) -> PartitionTimestamp {
        PartitionTimestamp::new(v)
    }

    fn txn(v: u64) -> Txn {
        Txn::new(v)
    }

    fn partitioned() -> ScoreboardConfig {
        ScoreboardConfig::default().with_partition_by(PartitionBy::Day)
    }

    #[test]
    fn fresh_unpartitioned_scoreboard_has_one_partition() {
        let dir = tempdir().unwrap();
        let sb = Scoreboard::open(dir.path(), ScoreboardConfig::default()).unwrap();
        assert_eq!(sb.partition_count().unwrap(), 1);
        assert_eq!(sb.partition_index(ts(0), txn(0)).unwrap(), Some(0));
        assert!(sb.path().ends_with("scoreboard.d"));
    }

    #[test]
    fn fresh_partitioned_scoreboard_is_empty() {
        let dir = tempdir().unwrap();
        let sb = Scoreboard::open(dir.path(), partitioned()).unwrap();
        assert_eq!(sb.partition_count().unwrap(), 0);
        assert_eq!(sb.mapped_size(), HEADER_SIZE);
    }

    #[test]
    fn add_partition_is_idempotent() {
        let dir = tempdir().unwrap();
        let sb = Scoreboard::open(dir.path(), partitioned()).unwrap();

        assert!(sb.add_partition(ts(86_400), txn(3)).unwrap());
        assert!(!sb.add_partition(ts(86_400), txn(3)).unwrap());
        assert_eq!(sb.partition_count().unwrap(), 1);
        assert_eq!(sb.access_counter(ts(86_400), txn(3)).unwrap(), 0);
        assert!(sb.partition_index(ts(86_400), txn(3)).unwrap().is_some());

        // A new version of the same partition shares the slot.
        assert!(sb.add_partition(ts(86_400), txn(4)).unwrap());
        assert_eq!(sb.partition_count().unwrap(), 1);
        assert_eq!(
            sb.partition_index(ts(86_400), txn(4)).unwrap(),
            sb.partition_index(ts(86_400), txn(3)).unwrap()
        );
    }

    #[test]
    fn add_partition_grows_by_doubling() {
        let dir = tempdir().unwrap();
        let sb = Scoreboard::open(dir.path(), partitioned()).unwrap();
        assert!(sb.add_partition(ts(1), txn(1)).unwrap());
        assert_eq!(sb.mapped_size(), 2 * scoreboard_size(1));

        // Next slot still fits in the doubled mapping.
        assert!(sb.add_partition(ts(2), txn(1)).unwrap());
        assert_eq!(sb.mapped_size(), 2 * scoreboard_size(1));

        for t in 3..=10 {
            assert!(sb.add_partition(ts(t), txn(1)).unwrap());
        }
        assert!(sb.mapped_size() >= scoreboard_size(10));
        assert_eq!(sb.partition_count().unwrap(), 10);
    }

    #[test]
    fn generation_moves_on_structural_change() {
        let dir = tempdir().unwrap();
        let sb = Scoreboard::open(dir.path(), partitioned()).unwrap();
        let g0 = sb.header_access_counter().unwrap();
        sb.add_partition(ts(1), txn(1)).unwrap();
        let g1 = sb.header_access_counter().unwrap();
        assert!(g1 > g0);
        sb.remove_partition(ts(1), txn(1)).unwrap();
        assert!(sb.header_access_counter().unwrap() > g1);
    }

    #[test]
    fn remove_partition_waits_for_readers() {
        let dir = tempdir().unwrap();
        let sb = Scoreboard::open(dir.path(), partitioned()).unwrap();
        sb.add_partition(ts(10), txn(1)).unwrap();

        assert!(sb.acquire_read_lock(ts(10), txn(1)).unwrap());
        assert!(!sb.remove_partition(ts(10), txn(1)).unwrap());
        assert_eq!(sb.partition_count().unwrap(), 1);

        sb.release_read_lock(ts(10), txn(1)).unwrap();
        assert!(sb.remove_partition(ts(10), txn(1)).unwrap());
        assert_eq!(sb.partition_count().unwrap(), 0);
        assert_eq!(sb.partition_index(ts(10), txn(1)).unwrap(), None);

        // Absent key: no-op.
        let g = sb.header_access_counter().unwrap();
        assert!(!sb.remove_partition(ts(10), txn(1)).unwrap());
        assert_eq!(sb.header_access_counter().unwrap(), g);
    }

    #[test]
    fn remove_partition_refuses_write_locked_version() {
        let dir = tempdir().unwrap();
        let sb = Scoreboard::open(dir.path(), partitioned()).unwrap();
        sb.add_partition(ts(10), txn(1)).unwrap();
        assert!(sb.acquire_write_lock(ts(10), txn(1)).unwrap());
        assert!(!sb.remove_partition(ts(10), txn(1)).unwrap());
        sb.release_write_lock(ts(10), txn(1)).unwrap();
        assert!(sb.remove_partition(ts(10), txn(1)).unwrap());
    }

    #[test]
    fn partition_versions_lists_entries() {
        let dir = tempdir().unwrap();
        let sb = Scoreboard::open(dir.path(), ScoreboardConfig::default()).unwrap();
        assert!(sb.acquire_read_lock(ts(0), txn(5)).unwrap());
        assert!(sb.acquire_write_lock(ts(0), txn(6)).unwrap());

        let versions = sb.partition_versions(ts(0)).unwrap();
        assert_eq!(
            versions,
            vec![
                VersionState {
                    txn: txn(0),
                    readers: 0,
                    write_locked: false
                },
                VersionState {
                    txn: txn(5),
                    readers: 1,
                    write_locked: false
                },
                VersionState {
                    txn: txn(6),
                    readers: 0,
                    write_locked: true
                },
            ]
        );
        assert!(sb.partition_versions(ts(1)).unwrap().is_empty());

        sb.release_read_lock(ts(0), txn(5)).unwrap();
        sb.release_write_lock(ts(0), txn(6)).unwrap();
    }

    #[test]
    fn closed_handle_rejects_operations() {
        let dir = tempdir().unwrap();
        let sb = Scoreboard::open(dir.path(), ScoreboardConfig::default()).unwrap();
        sb.close();
        sb.close();
        assert!(!sb.is_open());
        assert_eq!(sb.mapped_size(), 0);
        assert!(matches!(
            sb.acquire_read_lock(ts(0), txn(0)),
            Err(ScoreboardError::Closed)
        ));
        assert!(matches!(
            sb.add_partition(ts(1), txn(0)),
            Err(ScoreboardError::Closed)
        ));
        assert!(matches!(sb.partition_count(), Err(ScoreboardError::Closed)));
    }

    #[test]
    fn open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("scoreboard.d"), vec![0xFFu8; 128]).unwrap();
        let err = Scoreboard::open(dir.path(), ScoreboardConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.code(), "S004");
    }

    #[test]
    fn create_then_open() {
        let dir = tempdir().unwrap();
        Scoreboard::create(dir.path(), ScoreboardConfig::default()).unwrap();
        // Reopening with a different policy does not reseed.
        let sb = Scoreboard::open(dir.path(), partitioned()).unwrap();
        assert_eq!(sb.partition_count().unwrap(), 1);
    }
}
