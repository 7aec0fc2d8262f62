//! Lock and counter protocol over the mapped slot table.
//!
//! Every lock is a word in the mapped file, so the protocol works the same
//! between threads of one process and between processes mapping the same
//! file. Per-version read and write locks live in the entry's lock word:
//!
//! ```text
//!  63        62       61..48     47..0
//! ┌─────────┬────────┬─────────┬──────────────┐
//! │ reclaim │ write  │ unused  │ reader count │
//! └─────────┴────────┴─────────┴──────────────┘
//! ```
//!
//! Read and write lock operations never touch the header lock. They resolve
//! the entry optimistically, change the lock word with a CAS, and then
//! check that the entry still belongs to the requested (partition, txn):
//! if the generation stamp moved in between, the entry may have been
//! evicted or its slot retired and reused, so the change is undone and the
//! operation starts over. A free entry whose lock word is not zero is never
//! handed out again until that undo has happened.

use super::layout::{header, READER_MASK, RECLAIM_BIT, WRITE_BIT};
use super::slots::{Claim, Slot, SlotTable, VersionEntry};
use crate::error::Result;
use crate::region::MappedRegion;
use crate::types::{PartitionTimestamp, Txn};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

const LOCKED: u64 = 1;

/// Spin until `word` moves from 0 to locked.
///
/// Busy-waits `spins` times, then yields the thread between attempts.
fn acquire_spin(word: &AtomicU64, spins: u32) {
    let mut attempts = 0u32;
    loop {
        if word
            .compare_exchange_weak(0, LOCKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        if attempts < spins {
            attempts += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

/// Guard for a spin lock word inside the mapping.
pub struct SpinGuard<'a> {
    word: &'a AtomicU64,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

pub(crate) fn spin_lock(word: &AtomicU64, spins: u32) -> SpinGuard<'_> {
    acquire_spin(word, spins);
    SpinGuard { word }
}

/// The structural lock, held for the lifetime of the guard.
///
/// The guard owns the handle's region mutably so the mapping can be grown
/// while the lock is held; the lock word is looked up again on release
/// because growth replaces the mapping.
pub struct HeaderLockGuard<'r> {
    region: &'r mut MappedRegion,
}

impl<'r> HeaderLockGuard<'r> {
    /// Spin until the header lock is acquired.
    pub fn acquire(region: &'r mut MappedRegion, spins: u32) -> Self {
        acquire_spin(region.atomic_u64(header::HEADER_LOCK), spins);
        Self { region }
    }
}

impl Deref for HeaderLockGuard<'_> {
    type Target = MappedRegion;

    fn deref(&self) -> &MappedRegion {
        &*self.region
    }
}

impl DerefMut for HeaderLockGuard<'_> {
    fn deref_mut(&mut self) -> &mut MappedRegion {
        &mut *self.region
    }
}

impl Drop for HeaderLockGuard<'_> {
    fn drop(&mut self) {
        self.region
            .atomic_u64(header::HEADER_LOCK)
            .store(0, Ordering::Release);
    }
}

enum ReaderAttempt {
    Added,
    WriteLocked,
    Reclaiming,
}

enum WriterAttempt {
    Acquired,
    Busy,
    Reclaiming,
}

impl VersionEntry<'_> {
    /// Readers currently holding this version.
    pub fn readers(&self) -> u64 {
        self.lock.load(Ordering::SeqCst) & READER_MASK
    }

    /// Whether a writer holds this version.
    pub fn is_write_locked(&self) -> bool {
        self.lock.load(Ordering::SeqCst) & WRITE_BIT != 0
    }

    fn try_add_reader(&self) -> ReaderAttempt {
        let mut current = self.lock.load(Ordering::SeqCst);
        loop {
            if current & RECLAIM_BIT != 0 {
                return ReaderAttempt::Reclaiming;
            }
            if current & WRITE_BIT != 0 {
                return ReaderAttempt::WriteLocked;
            }
            assert!(current & READER_MASK < READER_MASK, "reader counter overflow");
            match self.lock.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return ReaderAttempt::Added,
                Err(actual) => current = actual,
            }
        }
    }

    fn remove_reader(&self, ts: PartitionTimestamp, txn: Txn) {
        let mut current = self.lock.load(Ordering::SeqCst);
        loop {
            if current & READER_MASK == 0 {
                panic!(
                    "read lock released without a matching acquire [ts={}, txn={}]",
                    ts, txn
                );
            }
            match self.lock.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn try_lock_write(&self) -> WriterAttempt {
        match self
            .lock
            .compare_exchange(0, WRITE_BIT, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => WriterAttempt::Acquired,
            Err(actual) if actual & RECLAIM_BIT != 0 => WriterAttempt::Reclaiming,
            Err(_) => WriterAttempt::Busy,
        }
    }

    fn unlock_write(&self, ts: PartitionTimestamp, txn: Txn) {
        let previous = self.lock.fetch_and(!WRITE_BIT, Ordering::SeqCst);
        if previous & WRITE_BIT == 0 {
            panic!("write lock released but not held [ts={}, txn={}]", ts, txn);
        }
    }

    /// Mark an unused entry (no readers, no writer) as being reclaimed.
    pub(super) fn try_reclaim(&self) -> bool {
        self.lock
            .compare_exchange(0, RECLAIM_BIT, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Reassign a reclaimed entry to `key` (0 frees it) and reopen it.
    ///
    /// This is the only place a lock word is overwritten, and only while the
    /// reclaim bit is held, so no stray count from an optimistic attempt can
    /// be lost and its undo always removes exactly what it added.
    pub(super) fn finish_reclaim(&self, key: u64) {
        debug_assert_eq!(self.lock.load(Ordering::SeqCst), RECLAIM_BIT);
        self.key.store(key, Ordering::SeqCst);
        self.lock.store(0, Ordering::SeqCst);
    }
}

/// Find the entry for (ts, txn), registering txn in the partition's slot if
/// it has not been seen yet. `None` when the partition is not tracked.
fn resolve<'a>(
    table: &SlotTable<'a>,
    ts: PartitionTimestamp,
    txn: Txn,
) -> Result<Option<(Slot<'a>, VersionEntry<'a>)>> {
    loop {
        let Some(index) = table.index_of(ts) else {
            return Ok(None);
        };
        let slot = table.slot(index);
        if let Some(found) = slot.find(txn) {
            return Ok(Some((slot, found)));
        }
        match table.claim(index, ts, txn)? {
            Claim::Found(e) | Claim::Claimed(e) => return Ok(Some((slot, e))),
            Claim::SlotGone => continue,
        }
    }
}

/// Entry already registered for (ts, txn), without claiming.
fn lookup<'a>(
    table: &SlotTable<'a>,
    ts: PartitionTimestamp,
    txn: Txn,
) -> Option<(Slot<'a>, VersionEntry<'a>)> {
    let slot = table.slot(table.index_of(ts)?);
    slot.find(txn).map(|e| (slot, e))
}

fn still_assigned(
    table: &SlotTable<'_>,
    generation: u64,
    slot: &Slot<'_>,
    entry: &VersionEntry<'_>,
    ts: PartitionTimestamp,
    txn: Txn,
) -> bool {
    table.generation() == generation || (slot.holds(ts) && entry.matches(txn))
}

/// Register a reader of version `txn` of partition `ts`.
///
/// Never blocks. Returns false, with nothing registered, when the partition
/// is not tracked or a writer holds that exact version.
pub fn acquire_read_lock(table: &SlotTable<'_>, ts: PartitionTimestamp, txn: Txn) -> Result<bool> {
    loop {
        let generation = table.generation();
        let Some((slot, entry)) = resolve(table, ts, txn)? else {
            return Ok(false);
        };
        match entry.try_add_reader() {
            ReaderAttempt::Added => {}
            ReaderAttempt::WriteLocked => return Ok(false),
            ReaderAttempt::Reclaiming => {
                std::hint::spin_loop();
                continue;
            }
        }
        if still_assigned(table, generation, &slot, &entry, ts, txn) {
            table.active_readers().fetch_add(1, Ordering::SeqCst);
            return Ok(true);
        }
        // The entry was reassigned between resolve and increment.
        entry.lock.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drop a reader registered by [`acquire_read_lock`].
///
/// # Panics
///
/// Panics if no reader of (ts, txn) is registered: releasing more often
/// than acquiring would let the version be deleted under a live reader.
pub fn release_read_lock(table: &SlotTable<'_>, ts: PartitionTimestamp, txn: Txn) {
    // A held read lock pins both the entry and its slot, so the lookup
    // cannot race with eviction or retirement.
    let Some((_, entry)) = lookup(table, ts, txn) else {
        panic!(
            "read lock released for untracked version [ts={}, txn={}]",
            ts, txn
        );
    };
    entry.remove_reader(ts, txn);
    table.active_readers().fetch_sub(1, Ordering::SeqCst);
}

/// Try to take the exclusive lock on version `txn` of partition `ts`.
///
/// Never blocks. Returns false when the partition is not tracked, another
/// writer holds the version, or readers are attached to it. Readers and
/// writers of other versions do not interfere.
pub fn acquire_write_lock(
    table: &SlotTable<'_>,
    ts: PartitionTimestamp,
    txn: Txn,
) -> Result<bool> {
    loop {
        let generation = table.generation();
        let Some((slot, entry)) = resolve(table, ts, txn)? else {
            return Ok(false);
        };
        match entry.try_lock_write() {
            WriterAttempt::Acquired => {}
            WriterAttempt::Busy => return Ok(false),
            WriterAttempt::Reclaiming => {
                std::hint::spin_loop();
                continue;
            }
        }
        if still_assigned(table, generation, &slot, &entry, ts, txn) {
            return Ok(true);
        }
        entry.lock.fetch_and(!WRITE_BIT, Ordering::SeqCst);
    }
}

/// Release a write lock taken with [`acquire_write_lock`].
///
/// # Panics
///
/// Panics if the version is not write-locked.
pub fn release_write_lock(table: &SlotTable<'_>, ts: PartitionTimestamp, txn: Txn) {
    let Some((_, entry)) = lookup(table, ts, txn) else {
        panic!(
            "write lock released for untracked version [ts={}, txn={}]",
            ts, txn
        );
    };
    entry.unlock_write(ts, txn);
}

/// Point-in-time reader count of (ts, txn); zero when untracked.
pub fn access_counter(table: &SlotTable<'_>, ts: PartitionTimestamp, txn: Txn) -> u64 {
    lookup(table, ts, txn).map_or(0, |(_, e)| e.readers())
}

/// Read locks held across the whole scoreboard.
pub fn active_reader_counter(table: &SlotTable<'_>) -> u64 {
    table.active_readers().load(Ordering::SeqCst)
}

/// Slot index of partition `ts` if version `txn` is registered in it.
pub fn partition_index(table: &SlotTable<'_>, ts: PartitionTimestamp, txn: Txn) -> Option<u64> {
    lookup(table, ts, txn).map(|(slot, _)| slot.index())
}

/// Whether a writer currently holds (ts, txn).
pub fn is_write_locked(table: &SlotTable<'_>, ts: PartitionTimestamp, txn: Txn) -> bool {
    lookup(table, ts, txn).is_some_and(|(_, e)| e.is_write_locked())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::layout::{scoreboard_size, VERSIONS_PER_SLOT};
    use crate::region::{FilesFacade, OsFilesFacade};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn region(slots: u64) -> (TempDir, MappedRegion) {
        let dir = tempdir().unwrap();
        let files: Arc<dyn FilesFacade> = Arc::new(OsFilesFacade);
        let region =
            MappedRegion::open(files, &dir.path().join("scoreboard.d"), scoreboard_size(slots))
                .unwrap();
        (dir, region)
    }

    fn ts(v: i64) -> PartitionTimestamp {
        PartitionTimestamp::new(v)
    }

    fn txn(v: u64) -> Txn {
        Txn::new(v)
    }

    #[test]
    fn readers_count_up_and_down() {
        let (_dir, region) = region(2);
        let table = SlotTable::new(&region, 8);
        table.append_slot(ts(0), txn(0));

        for _ in 0..3 {
            assert!(acquire_read_lock(&table, ts(0), txn(5)).unwrap());
        }
        assert_eq!(access_counter(&table, ts(0), txn(5)), 3);
        assert_eq!(active_reader_counter(&table), 3);

        release_read_lock(&table, ts(0), txn(5));
        release_read_lock(&table, ts(0), txn(5));
        assert_eq!(access_counter(&table, ts(0), txn(5)), 1);
        assert_eq!(active_reader_counter(&table), 1);
    }

    #[test]
    fn read_lock_on_untracked_partition_is_refused() {
        let (_dir, region) = region(1);
        let table = SlotTable::new(&region, 8);
        assert!(!acquire_read_lock(&table, ts(7), txn(1)).unwrap());
        assert_eq!(active_reader_counter(&table), 0);
    }

    #[test]
    fn write_lock_is_exclusive_per_version() {
        let (_dir, region) = region(1);
        let table = SlotTable::new(&region, 8);
        table.append_slot(ts(0), txn(0));

        assert!(acquire_read_lock(&table, ts(0), txn(5)).unwrap());
        assert!(!acquire_write_lock(&table, ts(0), txn(5)).unwrap());
        assert!(acquire_write_lock(&table, ts(0), txn(6)).unwrap());
        assert!(!acquire_write_lock(&table, ts(0), txn(6)).unwrap());
        assert!(is_write_locked(&table, ts(0), txn(6)));

        // Readers of another version are unaffected.
        assert!(acquire_read_lock(&table, ts(0), txn(5)).unwrap());
        // Readers of the locked version are turned away.
        assert!(!acquire_read_lock(&table, ts(0), txn(6)).unwrap());

        release_write_lock(&table, ts(0), txn(6));
        assert!(!is_write_locked(&table, ts(0), txn(6)));
        assert!(acquire_write_lock(&table, ts(0), txn(6)).unwrap());
    }

    #[test]
    fn read_undo_after_slot_retirement() {
        let (_dir, region) = region(2);
        let table = SlotTable::new(&region, 8);
        table.append_slot(ts(10), txn(1));
        table.append_slot(ts(20), txn(1));

        let generation = table.generation();
        let (slot, entry) = resolve(&table, ts(10), txn(1)).unwrap().unwrap();
        assert!(table.remove_slot(ts(10), txn(1)));

        // The increment lands on the freed entry and must be backed out.
        assert!(matches!(entry.try_add_reader(), ReaderAttempt::Added));
        assert!(!still_assigned(&table, generation, &slot, &entry, ts(10), txn(1)));
        entry.lock.fetch_sub(1, Ordering::SeqCst);

        assert_eq!(entry.lock.load(Ordering::SeqCst), 0);
        assert!(!acquire_read_lock(&table, ts(10), txn(1)).unwrap());
        assert_eq!(active_reader_counter(&table), 0);
        assert_eq!(access_counter(&table, ts(20), txn(1)), 0);
    }

    #[test]
    fn read_undo_after_slot_reuse_leaves_new_partition_intact() {
        let (_dir, region) = region(1);
        let table = SlotTable::new(&region, 8);
        table.append_slot(ts(10), txn(1));

        let generation = table.generation();
        let (slot, entry) = resolve(&table, ts(10), txn(1)).unwrap().unwrap();
        assert!(table.remove_slot(ts(10), txn(1)));
        assert!(matches!(entry.try_add_reader(), ReaderAttempt::Added));

        // The retired slot is reused while the stray count is still there;
        // the entry carrying it is not handed to the new partition.
        assert_eq!(table.append_slot(ts(20), txn(7)), 0);
        let (_, fresh) = lookup(&table, ts(20), txn(7)).unwrap();
        assert!(!std::ptr::eq(fresh.lock, entry.lock));
        assert_eq!(access_counter(&table, ts(20), txn(7)), 0);

        assert!(!still_assigned(&table, generation, &slot, &entry, ts(10), txn(1)));
        entry.lock.fetch_sub(1, Ordering::SeqCst);

        assert_eq!(entry.lock.load(Ordering::SeqCst), 0);
        assert_eq!(fresh.lock.load(Ordering::SeqCst), 0);
        assert!(!is_write_locked(&table, ts(20), txn(7)));
        assert!(acquire_write_lock(&table, ts(20), txn(7)).unwrap());
        release_write_lock(&table, ts(20), txn(7));
        assert!(acquire_read_lock(&table, ts(20), txn(7)).unwrap());
        release_read_lock(&table, ts(20), txn(7));
        assert!(table.remove_slot(ts(20), txn(7)));
    }

    #[test]
    fn read_undo_after_entry_eviction() {
        let (_dir, region) = region(1);
        let table = SlotTable::new(&region, 8);
        table.append_slot(ts(0), txn(0));
        for t in 1..VERSIONS_PER_SLOT as u64 {
            assert!(matches!(table.claim(0, ts(0), txn(t)).unwrap(), Claim::Claimed(_)));
        }
        // Pin every version except txn 3 so that it is the one evicted.
        let pinned: Vec<u64> = (0..VERSIONS_PER_SLOT as u64).filter(|&t| t != 3).collect();
        for &t in &pinned {
            assert!(acquire_read_lock(&table, ts(0), txn(t)).unwrap());
        }

        let generation = table.generation();
        let (slot, entry) = resolve(&table, ts(0), txn(3)).unwrap().unwrap();
        match table.claim(0, ts(0), txn(100)).unwrap() {
            Claim::Claimed(e) => assert!(std::ptr::eq(e.lock, entry.lock)),
            _ => panic!("expected txn 3 to be evicted"),
        }

        assert!(matches!(entry.try_add_reader(), ReaderAttempt::Added));
        assert!(!still_assigned(&table, generation, &slot, &entry, ts(0), txn(3)));
        entry.lock.fetch_sub(1, Ordering::SeqCst);

        assert_eq!(access_counter(&table, ts(0), txn(100)), 0);
        assert_eq!(access_counter(&table, ts(0), txn(3)), 0);
        assert_eq!(partition_index(&table, ts(0), txn(3)), None);
        assert!(acquire_write_lock(&table, ts(0), txn(100)).unwrap());
        release_write_lock(&table, ts(0), txn(100));

        for &t in &pinned {
            release_read_lock(&table, ts(0), txn(t));
            assert_eq!(access_counter(&table, ts(0), txn(t)), 0);
        }
        assert_eq!(active_reader_counter(&table), 0);
    }

    #[test]
    fn write_undo_after_slot_reuse() {
        let (_dir, region) = region(1);
        let table = SlotTable::new(&region, 8);
        table.append_slot(ts(10), txn(1));

        let generation = table.generation();
        let (slot, entry) = resolve(&table, ts(10), txn(1)).unwrap().unwrap();
        assert!(table.remove_slot(ts(10), txn(1)));
        assert!(matches!(entry.try_lock_write(), WriterAttempt::Acquired));

        table.append_slot(ts(20), txn(7));
        assert!(!is_write_locked(&table, ts(20), txn(7)));

        assert!(!still_assigned(&table, generation, &slot, &entry, ts(10), txn(1)));
        entry.lock.fetch_and(!WRITE_BIT, Ordering::SeqCst);

        assert_eq!(entry.lock.load(Ordering::SeqCst), 0);
        assert!(acquire_read_lock(&table, ts(20), txn(7)).unwrap());
        assert_eq!(access_counter(&table, ts(20), txn(7)), 1);
        release_read_lock(&table, ts(20), txn(7));
        assert!(table.remove_slot(ts(20), txn(7)));
    }

    #[test]
    fn partition_index_requires_registered_version() {
        let (_dir, region) = region(2);
        let table = SlotTable::new(&region, 8);
        table.append_slot(ts(100), txn(1));
        table.append_slot(ts(200), txn(1));
        assert_eq!(partition_index(&table, ts(200), txn(1)), Some(1));
        assert_eq!(partition_index(&table, ts(200), txn(2)), None);
        assert_eq!(partition_index(&table, ts(300), txn(1)), None);
    }

    #[test]
    #[should_panic(expected = "without a matching acquire")]
    fn unbalanced_release_panics() {
        let (_dir, region) = region(1);
        let table = SlotTable::new(&region, 8);
        table.append_slot(ts(0), txn(1));
        release_read_lock(&table, ts(0), txn(1));
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn release_of_unheld_write_lock_panics() {
        let (_dir, region) = region(1);
        let table = SlotTable::new(&region, 8);
        table.append_slot(ts(0), txn(1));
        release_write_lock(&table, ts(0), txn(1));
    }

    #[test]
    fn header_lock_is_released_on_drop() {
        let (_dir, mut region) = region(1);
        {
            let guard = HeaderLockGuard::acquire(&mut region, 4);
            assert_eq!(
                guard.atomic_u64(header::HEADER_LOCK).load(Ordering::SeqCst),
                LOCKED
            );
        }
        assert_eq!(
            region.atomic_u64(header::HEADER_LOCK).load(Ordering::SeqCst),
            0
        );
    }

    #[test]
    fn header_lock_survives_growth() {
        let (_dir, mut region) = region(1);
        {
            let mut guard = HeaderLockGuard::acquire(&mut region, 4);
            guard.ensure_capacity(scoreboard_size(16)).unwrap();
            assert_eq!(
                guard.atomic_u64(header::HEADER_LOCK).load(Ordering::SeqCst),
                LOCKED
            );
        }
        assert_eq!(
            region.atomic_u64(header::HEADER_LOCK).load(Ordering::SeqCst),
            0
        );
    }

    #[test]
    fn spin_lock_excludes_other_threads() {
        let (_dir, region) = region(1);
        let word = region.atomic_u64(header::HEADER_LOCK);
        let counter = AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let _guard = spin_lock(word, 16);
                        // Non-atomic read-modify-write; only safe under the lock.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 4000);
    }
}
