//! # DRAM Row Directory
//!
//! The row directory maps a rowid to its per-row coordination record: a
//! lock, the resolved PM address, access counters, the cached commit CSN,
//! and an optional DRAM shadow of the tuple for read-mostly rows.
//!
//! ## Two-Level Layout
//!
//! ```text
//! level 1: fixed array of u32::MAX / 256Ki segment slots (lazy)
//! level 2: 256Ki RowIdMapEntry records per segment
//! entry(row_id) = segments[row_id / 256Ki][row_id % 256Ki]
//! ```
//!
//! Entries are created on first access to an existing PM tuple and live
//! until the table is dropped at shutdown; they are plain non-owning
//! references into PM the tablespace owns.
//!
//! ## Publication Order
//!
//! An entry becomes visible in two steps: the PM address is stored first,
//! then the validity flag with release ordering. A reader that observes
//! `is_valid()` (acquire) is therefore guaranteed to see the address.
//!
//! ## DRAM Shadow
//!
//! `load_cache` returns the PM address until the read/write ratio says a
//! row is read-mostly (`reads > 4 * writes`); then the tuple is copied
//! into an 8-aligned DRAM buffer and reads are served from it. Writers go
//! through `write_through`, which applies the mutation to the shadow (when
//! present) and synchronizes the PM copy, or mutates PM directly.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

use eyre::Result;
use parking_lot::{Mutex, MutexGuard};

use crate::config::constants::{
    INVALID_CSN, INVALID_ROW_ID, ROWID_MAP_SEGMENTS, ROWID_MAP_SEGMENT_LEN,
};
use crate::heap::rowid_mgr::RowIdMgr;
use crate::heap::tuple::{RowId, TupleHeader};
use crate::heap::vecstore::{TableCache, VecStore};
use crate::pmem;
use crate::storage::PageId;

/// 8-aligned DRAM shadow of one tuple; empty when the row is served from
/// PM directly. Guarded by the entry lock.
#[derive(Default)]
pub struct EntryCache {
    words: Vec<u64>,
}

impl EntryCache {
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.words.len() * 8
    }

    pub fn clear(&mut self) {
        self.words = Vec::new();
    }

    fn ensure_len(&mut self, bytes: usize) {
        self.words.resize(bytes.div_ceil(8), 0);
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr() as *mut u8
    }
}

/// Per-row coordination record, one cache line wide.
#[repr(align(64))]
pub struct RowIdMapEntry {
    valid: AtomicBool,
    nvm_addr: AtomicPtr<u8>,
    read_count: AtomicU32,
    write_count: AtomicU32,
    ref_count: AtomicI32,
    /// CSN of the last committed write, cached to spare a PM read.
    surrogate: AtomicU64,
    cache: Mutex<EntryCache>,
}

impl Default for RowIdMapEntry {
    fn default() -> Self {
        Self {
            valid: AtomicBool::new(false),
            nvm_addr: AtomicPtr::new(std::ptr::null_mut()),
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
            ref_count: AtomicI32::new(0),
            surrogate: AtomicU64::new(INVALID_CSN),
            cache: Mutex::new(EntryCache::default()),
        }
    }
}

impl RowIdMapEntry {
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Record the PM address and publish validity. Address first, flag
    /// second: a reader that sees the flag sees the address.
    fn init(&self, nvm_addr: *mut u8) {
        self.nvm_addr.store(nvm_addr, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    pub fn nvm_addr(&self) -> *mut u8 {
        self.nvm_addr.load(Ordering::Acquire)
    }

    /// PM tuple header of this row.
    pub fn header(&self) -> &TupleHeader {
        // SAFETY: nvm_addr was resolved through RowIdMgr, so it points at
        // a mapped, 8-aligned tuple slot that outlives the entry.
        unsafe { TupleHeader::from_addr(self.nvm_addr()) }
    }

    pub fn lock(&self) -> MutexGuard<'_, EntryCache> {
        self.cache.lock()
    }

    pub fn surrogate_key(&self) -> u64 {
        self.surrogate.load(Ordering::Relaxed)
    }

    pub fn set_surrogate_key(&self, csn: u64) {
        self.surrogate.store(csn, Ordering::Relaxed);
    }

    pub fn add_read_ref(&self) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_write_ref(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_refs(&self) {
        self.read_count.store(0, Ordering::Relaxed);
        self.write_count.store(0, Ordering::Relaxed);
    }

    pub fn increase_reference(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::Relaxed)
    }

    pub fn decrease_reference(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::Relaxed)
    }

    fn wants_cache(&self) -> bool {
        // Inserts do not bump the write counter, so freshly inserted rows
        // qualify as soon as they are read.
        self.read_count.load(Ordering::Relaxed) > 4 * self.write_count.load(Ordering::Relaxed)
    }

    /// Address to read `size` bytes of this tuple from: the DRAM shadow
    /// when engaged (populating it when the heuristic fires), PM
    /// otherwise. Caller holds the entry lock.
    pub fn load_cache(&self, cache: &mut EntryCache, size: usize) -> *const u8 {
        if !cache.is_empty() && cache.byte_len() >= size {
            return cache.as_ptr();
        }
        if self.wants_cache() {
            cache.ensure_len(size);
            // SAFETY: the PM slot holds at least `size` bytes (callers
            // pass the table's slot width) and the shadow was just sized.
            unsafe {
                std::ptr::copy_nonoverlapping(self.nvm_addr(), cache.as_mut_ptr(), size);
            }
            return cache.as_ptr();
        }
        self.nvm_addr()
    }

    /// Apply a mutation write-through: on the shadow (then synchronized to
    /// PM durably) when one large enough is engaged, directly on PM
    /// otherwise. Caller holds the entry lock; the mutation itself must
    /// leave PM durable when handed the PM address.
    pub fn write_through(
        &self,
        cache: &mut EntryCache,
        sync_size: usize,
        mutate: impl FnOnce(*mut u8),
    ) {
        if cache.byte_len() < sync_size {
            cache.clear();
        }
        if cache.is_empty() {
            mutate(self.nvm_addr());
            return;
        }
        mutate(cache.as_mut_ptr());
        // SAFETY: shadow holds sync_size valid bytes; the PM slot is at
        // least as large.
        unsafe {
            let shadow = std::slice::from_raw_parts(cache.as_ptr(), sync_size);
            pmem::write_to_nvm(self.nvm_addr(), shadow);
        }
    }

    /// Flush the PM header line (release-ordered stores already done by
    /// the caller).
    pub fn flush_header_to_nvm(&self) {
        self.header().flush();
        pmem::sfence();
    }

    /// Commit write-back: replace `tx_info` with the commit CSN in place
    /// (single aligned 8-byte store), flush its line, remember the CSN as
    /// the surrogate key. The caller batches one fence over all entries.
    pub fn write_back_csn(&self, csn: u64) {
        let header = self.header();
        header.set_tx_info(csn);
        header.flush();
        self.set_surrogate_key(csn);
    }
}

type EntrySegment = Box<[RowIdMapEntry]>;

/// Per-table row directory plus the two allocators behind it.
pub struct RowIdMap {
    seg_head: PageId,
    row_len: u32,
    mgr: RowIdMgr,
    vec_store: VecStore,
    segments: Box<[OnceLock<EntrySegment>]>,
}

impl RowIdMap {
    pub fn new(
        space: std::sync::Arc<crate::storage::TableSpace>,
        seg_head: PageId,
        row_len: u32,
    ) -> Result<Self> {
        let mgr = RowIdMgr::new(space.clone(), seg_head, row_len)?;
        let vec_store = VecStore::new(space.dir_count() as usize, mgr.tuples_per_extent());
        let segments = (0..ROWID_MAP_SEGMENTS)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            seg_head,
            row_len,
            mgr,
            vec_store,
            segments,
        })
    }

    pub fn seg_head(&self) -> PageId {
        self.seg_head
    }

    pub fn row_len(&self) -> u32 {
        self.row_len
    }

    pub fn mgr(&self) -> &RowIdMgr {
        &self.mgr
    }

    pub fn upper_row_id(&self) -> Result<RowId> {
        self.mgr.upper_row_id()
    }

    fn segment(&self, seg_idx: usize) -> &EntrySegment {
        self.segments[seg_idx].get_or_init(|| {
            (0..ROWID_MAP_SEGMENT_LEN)
                .map(|_| RowIdMapEntry::default())
                .collect()
        })
    }

    /// Entry for `row_id`, resolving the PM tuple on first touch. For a
    /// read, a row whose extent was never materialized (or whose PM slot
    /// was never used) yields None.
    pub fn get_entry(&self, row_id: RowId, for_read: bool) -> Result<Option<&RowIdMapEntry>> {
        debug_assert_ne!(row_id, INVALID_ROW_ID);
        let seg_idx = row_id as usize / ROWID_MAP_SEGMENT_LEN;
        let entry = &self.segment(seg_idx)[row_id as usize % ROWID_MAP_SEGMENT_LEN];

        if !entry.is_valid() {
            let Some(nvm_addr) = self.mgr.tuple_addr(row_id, false)? else {
                // Writers land here only when handed a rowid that was
                // never allocated; the caller maps None to a status.
                let _ = for_read;
                return Ok(None);
            };
            let _guard = entry.lock();
            if !entry.is_valid() {
                entry.init(nvm_addr);
            }
        }
        Ok(Some(entry))
    }

    /// Reserve a fresh row for insert: loop over candidate rowids until an
    /// unused PM slot is found, stamp it with the transaction's slot
    /// pointer and return it. A used slot on a thread's very first
    /// reservation abandons the whole range (it predates this run).
    pub fn get_next_empty_row(
        &self,
        tx_slot_ptr: u64,
        cache: &mut TableCache,
    ) -> Result<Option<(RowId, *mut u8)>> {
        loop {
            let row_id = self.vec_store.try_next_rowid(cache);
            if row_id == INVALID_ROW_ID {
                return Ok(None);
            }
            let addr = self
                .mgr
                .tuple_addr(row_id, true)?
                .expect("append materializes the extent");
            // SAFETY: addr is a mapped, aligned tuple slot.
            let header = unsafe { TupleHeader::from_addr(addr) };
            if header.is_used() {
                if !cache.insert_init {
                    self.vec_store.try_next_segment(cache);
                }
                continue;
            }
            cache.insert_init = true;
            // Release store: the reservation is visible before any later
            // header mutation.
            header.set_tx_info(tx_slot_ptr);
            return Ok(Some((row_id, addr)));
        }
    }

    pub fn vec_store(&self) -> &VecStore {
        &self.vec_store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::constants::EXTENT_SIZE;
    use crate::config::DirectoryConfig;
    use crate::storage::TableSpace;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn map(root: &std::path::Path, row_len: u32) -> RowIdMap {
        let config = Arc::new(
            DirectoryConfig::new(&root.join("n0").display().to_string(), false).unwrap(),
        );
        let space = Arc::new(TableSpace::create(config, 4 * EXTENT_SIZE).unwrap());
        let seg_head = space.alloc_extent(0).unwrap();
        RowIdMap::new(space, seg_head, row_len).unwrap()
    }

    #[test]
    fn get_entry_for_read_of_untouched_row_is_none() {
        let dir = tempdir().unwrap();
        let map = map(dir.path(), 100);

        assert!(map.get_entry(0, true).unwrap().is_none());
    }

    #[test]
    fn reserved_row_resolves_to_a_valid_entry() {
        let dir = tempdir().unwrap();
        let map = map(dir.path(), 100);
        let mut cache = TableCache::default();

        let (row_id, addr) = map.get_next_empty_row(7, &mut cache).unwrap().unwrap();
        assert_eq!(row_id, 0);

        let entry = map.get_entry(row_id, false).unwrap().unwrap();
        assert!(entry.is_valid());
        assert_eq!(entry.nvm_addr(), addr);
        assert_eq!(entry.header().tx_info(), 7);
    }

    #[test]
    fn reservations_are_exclusive_within_a_thread_cache() {
        let dir = tempdir().unwrap();
        let map = map(dir.path(), 100);
        let mut cache = TableCache::default();

        let (a, _) = map.get_next_empty_row(1, &mut cache).unwrap().unwrap();
        let (b, _) = map.get_next_empty_row(1, &mut cache).unwrap().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn used_slot_is_skipped_after_restartlike_state() {
        let dir = tempdir().unwrap();
        let map = map(dir.path(), 100);
        let mut cache = TableCache::default();

        // Leave rowid 0 used on PM, as a previous run would have.
        let (r0, addr) = map.get_next_empty_row(5, &mut cache).unwrap().unwrap();
        assert_eq!(r0, 0);
        let header = unsafe { TupleHeader::from_addr(addr) };
        header.set_used(true);

        // A fresh thread cache replays rowid 0, detects the collision and
        // abandons the range.
        let mut fresh = TableCache::default();
        let (r1, _) = map.get_next_empty_row(6, &mut fresh).unwrap().unwrap();
        assert_ne!(r1, 0);
        assert!(fresh.insert_init);
    }

    #[test]
    fn shadow_cache_engages_for_read_mostly_rows() {
        let dir = tempdir().unwrap();
        let map = map(dir.path(), 100);
        let mut cache = TableCache::default();
        let (row_id, addr) = map.get_next_empty_row(3, &mut cache).unwrap().unwrap();
        let entry = map.get_entry(row_id, false).unwrap().unwrap();

        let slot = map.mgr().tuple_len() as usize;
        let mut guard = entry.lock();
        // Cold: served from PM.
        assert_eq!(entry.load_cache(&mut guard, slot), addr as *const u8);

        for _ in 0..8 {
            entry.add_read_ref();
        }
        let ptr = entry.load_cache(&mut guard, slot);
        assert_ne!(ptr, addr as *const u8);
        assert!(!guard.is_empty());
    }

    #[test]
    fn write_through_keeps_shadow_and_pm_in_sync() {
        let dir = tempdir().unwrap();
        let map = map(dir.path(), 100);
        let mut cache = TableCache::default();
        let (row_id, addr) = map.get_next_empty_row(3, &mut cache).unwrap().unwrap();
        let entry = map.get_entry(row_id, false).unwrap().unwrap();
        let slot = map.mgr().tuple_len() as usize;

        let mut guard = entry.lock();
        for _ in 0..8 {
            entry.add_read_ref();
        }
        entry.load_cache(&mut guard, slot); // engage the shadow

        entry.write_through(&mut guard, slot, |dst| unsafe {
            dst.add(24).write(0x5A);
        });

        // PM saw the write.
        assert_eq!(unsafe { addr.add(24).read() }, 0x5A);
        // And the shadow serves the same byte.
        let ptr = entry.load_cache(&mut guard, slot);
        assert_eq!(unsafe { ptr.add(24).read() }, 0x5A);
    }
}
