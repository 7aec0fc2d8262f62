//! Partition slot table.
//!
//! A fixed-capacity array of slots following the header, one per live
//! partition. Slots never move: removing a partition retires its slot in
//! place and a later `add_partition` may reuse the position. Every change
//! that alters which partition or txn a position stands for bumps the
//! generation stamp, which lock-free readers use to detect that the entry
//! they resolved may have been reassigned underneath them.

use super::layout::{
    entry, entry_offset, header, slot, slot_capacity, slot_offset, SLOT_LIVE, SLOT_RETIRED,
    VERSIONS_PER_SLOT,
};
use super::protocol::{spin_lock, SpinGuard};
use crate::error::{Result, ScoreboardError};
use crate::region::MappedRegion;
use crate::types::{PartitionTimestamp, Txn};
use std::sync::atomic::{AtomicU64, Ordering};

/// View of the slot table through one handle's current mapping.
#[derive(Clone, Copy)]
pub struct SlotTable<'a> {
    region: &'a MappedRegion,
    spins: u32,
}

/// Outcome of registering a txn in a partition slot.
pub enum Claim<'a> {
    /// The txn already had an entry.
    Found(VersionEntry<'a>),
    /// A free or idle entry was assigned to the txn.
    Claimed(VersionEntry<'a>),
    /// The slot no longer holds the requested partition.
    SlotGone,
}

impl<'a> SlotTable<'a> {
    /// Create a view over `region`. `spins` bounds busy-waiting on the
    /// per-slot claim lock before yielding.
    pub fn new(region: &'a MappedRegion, spins: u32) -> Self {
        Self { region, spins }
    }

    fn word(&self, offset: u64) -> &'a AtomicU64 {
        self.region.atomic_u64(offset)
    }

    /// Number of live partitions.
    pub fn partition_count(&self) -> u64 {
        self.word(header::PARTITION_COUNT).load(Ordering::SeqCst)
    }

    /// Number of slot positions in use, live or retired.
    ///
    /// Read without any lock; the value may be stale as soon as it is
    /// returned.
    pub fn slot_count(&self) -> u64 {
        self.word(header::SLOT_HIGH_WATER).load(Ordering::SeqCst)
    }

    /// Current generation stamp.
    pub fn generation(&self) -> u64 {
        self.word(header::GENERATION).load(Ordering::SeqCst)
    }

    pub(crate) fn bump_generation(&self) {
        self.word(header::GENERATION).fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn active_readers(&self) -> &'a AtomicU64 {
        self.word(header::ACTIVE_READERS)
    }

    /// Slots that fit in this handle's mapping.
    pub fn capacity(&self) -> u64 {
        slot_capacity(self.region.size())
    }

    /// Slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not inside this handle's mapping.
    pub fn slot(&self, index: u64) -> Slot<'a> {
        assert!(
            index < self.capacity(),
            "slot {index} beyond mapped capacity {}",
            self.capacity()
        );
        Slot {
            region: self.region,
            index,
        }
    }

    /// Index of the live slot for `ts`, scanning the used prefix.
    pub fn index_of(&self, ts: PartitionTimestamp) -> Option<u64> {
        let visible = self.slot_count().min(self.capacity());
        (0..visible).find(|&index| self.slot(index).holds(ts))
    }

    /// Position the next new partition will occupy: the first retired slot,
    /// or the end of the used prefix.
    pub fn next_position(&self) -> u64 {
        let used = self.slot_count();
        (0..used.min(self.capacity()))
            .find(|&index| self.slot(index).state() == SLOT_RETIRED)
            .unwrap_or(used)
    }

    /// Publish a new slot for `ts` with `txn` as its first version.
    ///
    /// Requires the header lock and a mapping that covers
    /// [`Self::next_position`].
    pub fn append_slot(&self, ts: PartitionTimestamp, txn: Txn) -> u64 {
        let index = self.next_position();
        let target = self.slot(index);
        let _claims = target.lock_claims(self.spins);
        debug_assert_ne!(target.state(), SLOT_LIVE);
        debug_assert!(target.is_vacant());

        target
            .word(slot::TIMESTAMP)
            .store(ts.as_i64() as u64, Ordering::SeqCst);
        let first = loop {
            if let Some(free) = target.take_free_entry() {
                break free;
            }
            // Every entry still carries a count from a lock attempt that is
            // backing out of the previous occupant.
            std::hint::spin_loop();
        };
        first.finish_reclaim(txn.to_key());
        target.word(slot::STATE).store(SLOT_LIVE, Ordering::SeqCst);

        if index == self.slot_count() {
            self.word(header::SLOT_HIGH_WATER)
                .store(index + 1, Ordering::SeqCst);
        }
        self.word(header::PARTITION_COUNT)
            .fetch_add(1, Ordering::SeqCst);
        self.bump_generation();
        index
    }

    /// Remove version `txn` of partition `ts`, retiring the slot when it was
    /// the last version.
    ///
    /// Requires the header lock. Returns false when the version is absent,
    /// still has readers, or is write-locked.
    pub fn remove_slot(&self, ts: PartitionTimestamp, txn: Txn) -> bool {
        let Some(index) = self.index_of(ts) else {
            return false;
        };
        let target = self.slot(index);
        let _claims = target.lock_claims(self.spins);

        let Some(version) = target.find(txn) else {
            return false;
        };
        if !version.try_reclaim() {
            return false;
        }
        self.bump_generation();
        version.finish_reclaim(0);

        if target.is_vacant() {
            target
                .word(slot::STATE)
                .store(SLOT_RETIRED, Ordering::SeqCst);
            self.word(header::PARTITION_COUNT)
                .fetch_sub(1, Ordering::SeqCst);
            self.bump_generation();
        }
        true
    }

    /// Register `txn` in slot `index`, which was resolved for `ts`.
    ///
    /// Uses a free entry if there is one, otherwise evicts an entry with no
    /// readers and no writer.
    pub fn claim(&self, index: u64, ts: PartitionTimestamp, txn: Txn) -> Result<Claim<'a>> {
        let target = self.slot(index);
        let _claims = target.lock_claims(self.spins);

        if !target.holds(ts) {
            return Ok(Claim::SlotGone);
        }
        if let Some(found) = target.find(txn) {
            return Ok(Claim::Found(found));
        }

        let key = txn.to_key();
        loop {
            if let Some(free) = target.take_free_entry() {
                free.finish_reclaim(key);
                return Ok(Claim::Claimed(free));
            }

            for idle in target.entries().filter(|e| e.txn().is_some()) {
                if idle.try_reclaim() {
                    tracing::debug!(
                        ts = %ts,
                        evicted = ?idle.txn(),
                        txn = %txn,
                        "Evicted idle version entry"
                    );
                    self.bump_generation();
                    idle.finish_reclaim(key);
                    return Ok(Claim::Claimed(idle));
                }
            }

            // A free entry with a nonzero lock word belongs to a lock attempt
            // that is about to undo itself.
            if !target.entries().any(|e| e.txn().is_none()) {
                return Err(ScoreboardError::VersionsExhausted {
                    ts,
                    capacity: VERSIONS_PER_SLOT,
                });
            }
            std::hint::spin_loop();
        }
    }
}

/// One partition slot.
#[derive(Clone, Copy)]
pub struct Slot<'a> {
    region: &'a MappedRegion,
    index: u64,
}

impl<'a> Slot<'a> {
    fn word(&self, field: u64) -> &'a AtomicU64 {
        self.region.atomic_u64(slot_offset(self.index) + field)
    }

    /// Position of this slot in the table.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Raw slot state.
    pub fn state(&self) -> u64 {
        self.word(slot::STATE).load(Ordering::SeqCst)
    }

    /// Partition this slot was last assigned to.
    pub fn timestamp(&self) -> PartitionTimestamp {
        PartitionTimestamp::new(self.word(slot::TIMESTAMP).load(Ordering::SeqCst) as i64)
    }

    /// Whether this slot is live and tracks `ts`.
    pub fn holds(&self, ts: PartitionTimestamp) -> bool {
        self.state() == SLOT_LIVE && self.timestamp() == ts
    }

    /// Version entry `i`.
    pub fn entry(&self, i: usize) -> VersionEntry<'a> {
        debug_assert!(i < VERSIONS_PER_SLOT);
        let base = entry_offset(self.index, i);
        VersionEntry {
            key: self.region.atomic_u64(base + entry::KEY),
            lock: self.region.atomic_u64(base + entry::LOCK),
        }
    }

    /// All version entries, free ones included.
    pub fn entries(&self) -> impl Iterator<Item = VersionEntry<'a>> + 'a {
        let this = *self;
        (0..VERSIONS_PER_SLOT).map(move |i| this.entry(i))
    }

    /// Entry registered for `txn`.
    pub fn find(&self, txn: Txn) -> Option<VersionEntry<'a>> {
        let key = txn.to_key();
        self.entries().find(|e| e.key.load(Ordering::SeqCst) == key)
    }

    /// Reserve a free entry whose lock word is clear.
    ///
    /// The entry is returned in the reclaiming state; the caller assigns it
    /// with `finish_reclaim`. Free entries whose lock word is not zero are
    /// skipped: an optimistic lock attempt on their previous owner has not
    /// undone its change yet. Requires the slot's claim lock.
    fn take_free_entry(&self) -> Option<VersionEntry<'a>> {
        self.entries()
            .find(|e| e.key.load(Ordering::SeqCst) == 0 && e.try_reclaim())
    }

    /// Whether no entry is registered.
    pub fn is_vacant(&self) -> bool {
        self.entries().all(|e| e.key.load(Ordering::SeqCst) == 0)
    }

    fn lock_claims(&self, spins: u32) -> SpinGuard<'a> {
        spin_lock(self.word(slot::CLAIM_LOCK), spins)
    }
}

/// One (txn, lock word) pair of a slot.
#[derive(Clone, Copy)]
pub struct VersionEntry<'a> {
    pub(super) key: &'a AtomicU64,
    pub(super) lock: &'a AtomicU64,
}

impl VersionEntry<'_> {
    /// Txn this entry is registered for, if any.
    pub fn txn(&self) -> Option<Txn> {
        Txn::from_key(self.key.load(Ordering::SeqCst))
    }

    /// Whether this entry is registered for `txn`.
    pub fn matches(&self, txn: Txn) -> bool {
        self.key.load(Ordering::SeqCst) == txn.to_key()
    }
}
