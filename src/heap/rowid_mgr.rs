//! # RowId Translation
//!
//! A table is a segment-head extent plus any number of leaf extents. The
//! segment head stores the table's extent directory on PM:
//!
//! ```text
//! segment-head extent
//! +--------------------------+
//! | extent header (64 B)     |
//! | max_extent_id: u32       |  highest installed logical extent
//! | extent_ids[0]: u32       |  page id of logical extent 0
//! | extent_ids[1]: u32       |  ...
//! +--------------------------+
//! ```
//!
//! Translation is pure arithmetic:
//!
//! ```text
//! leaf   = row_id / tuples_per_extent
//! offset = row_id % tuples_per_extent
//! addr   = page_base(extent_ids[leaf]) + EXTENT_HEADER_SIZE + offset * tuple_len
//! ```
//!
//! A zero extent id means "extent never materialized" — page 0 is the
//! tablespace header and can never belong to a table.
//!
//! ## Installing a New Extent
//!
//! Allocation is optimistic: the extent is pulled from the tablespace
//! outside the lock, then installed under the table's allocation mutex at
//! the first free logical slot walking forward in `dir_count` strides.
//! The stride keeps the logical-extent → NUMA-directory mapping intact
//! when two threads race for the same leaf: the loser's extent lands on a
//! later slot of the same stripe instead of crossing nodes. The
//! `max_extent_id` CAS uses the slot actually installed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::config::constants::{EXTENT_HEADER_SIZE, EXTENT_SIZE};
use crate::heap::tuple::{tuple_slot_len, RowId};
use crate::numa;
use crate::pmem;
use crate::storage::{page_id_is_valid, PageId, TableSpace};

/// Capacity of the extent-id directory inside the segment head.
const EXTENT_MAP_CAPACITY: u32 =
    ((EXTENT_SIZE - EXTENT_HEADER_SIZE - size_of::<u32>()) / size_of::<u32>()) as u32;

pub struct RowIdMgr {
    space: Arc<TableSpace>,
    seg_head: PageId,
    tuple_len: u32,
    tuples_per_extent: u32,
    alloc_mutex: Mutex<()>,
}

impl RowIdMgr {
    pub fn new(space: Arc<TableSpace>, seg_head: PageId, row_len: u32) -> Result<Self> {
        let tuple_len = tuple_slot_len(row_len);
        let tuples_per_extent = (EXTENT_SIZE - EXTENT_HEADER_SIZE) as u32 / tuple_len;
        ensure!(
            tuples_per_extent > 0,
            "row length {} leaves no tuples per extent",
            row_len
        );
        // Make sure the segment head is addressable even when it was
        // installed by an earlier process run.
        space.ensure_mounted(seg_head)?;
        Ok(Self {
            space,
            seg_head,
            tuple_len,
            tuples_per_extent,
            alloc_mutex: Mutex::new(()),
        })
    }

    pub fn tuples_per_extent(&self) -> u32 {
        self.tuples_per_extent
    }

    pub fn tuple_len(&self) -> u32 {
        self.tuple_len
    }

    fn max_extent_id(&self) -> Result<&AtomicU32> {
        let root = self.space.page_addr(self.seg_head)?;
        // SAFETY: the segment head extent is mapped for the life of the
        // store; EXTENT_HEADER_SIZE keeps the counter 4-aligned.
        Ok(unsafe { &*(root.add(EXTENT_HEADER_SIZE) as *const AtomicU32) })
    }

    fn extent_id_slot(&self, leaf: u32) -> Result<&AtomicU32> {
        let root = self.space.page_addr(self.seg_head)?;
        // SAFETY: leaf is bounded by EXTENT_MAP_CAPACITY at every call
        // site, keeping the slot inside the segment-head extent.
        Ok(unsafe {
            &*(root
                .add(EXTENT_HEADER_SIZE + size_of::<u32>() + leaf as usize * size_of::<u32>())
                as *const AtomicU32)
        })
    }

    /// Exclusive upper bound over every rowid the table may have handed
    /// out.
    pub fn upper_row_id(&self) -> Result<RowId> {
        let max = self.max_extent_id()?.load(Ordering::Acquire) as u64;
        Ok(((max + 1) * self.tuples_per_extent as u64).min(u32::MAX as u64) as RowId)
    }

    /// PM address of the tuple slot for `row_id`. With `append` the leaf
    /// extent is allocated on first touch; otherwise a missing extent
    /// yields None (the row was never used).
    pub fn tuple_addr(&self, row_id: RowId, append: bool) -> Result<Option<*mut u8>> {
        let leaf = row_id / self.tuples_per_extent;
        let offset = row_id % self.tuples_per_extent;
        ensure!(leaf < EXTENT_MAP_CAPACITY, "rowid {} beyond extent directory", row_id);

        let slot = self.extent_id_slot(leaf)?;
        if !page_id_is_valid(slot.load(Ordering::Acquire)) {
            if !append {
                return Ok(None);
            }
            self.try_alloc_new_page(leaf)?;
        }

        let page_id = slot.load(Ordering::Acquire);
        debug_assert!(page_id_is_valid(page_id));
        self.space.ensure_mounted(page_id)?;
        let extent = self.space.page_addr(page_id)?;
        // SAFETY: offset < tuples_per_extent, so the slot lies inside the
        // extent's payload area.
        let tuple = unsafe {
            extent.add(EXTENT_HEADER_SIZE + offset as usize * self.tuple_len as usize)
        };
        Ok(Some(tuple))
    }

    /// Allocate a leaf extent and install its page id, walking forward by
    /// `dir_count` if a racing thread took the slot first.
    fn try_alloc_new_page(&self, leaf: u32) -> Result<()> {
        if page_id_is_valid(self.extent_id_slot(leaf)?.load(Ordering::Acquire)) {
            return Ok(());
        }
        let page_id = self.space.alloc_extent(numa::current_node())?;

        let _guard = self.alloc_mutex.lock();
        let dir_count = self.space.dir_count();
        let mut leaf = leaf;
        while page_id_is_valid(self.extent_id_slot(leaf)?.load(Ordering::Relaxed)) {
            leaf += dir_count;
            ensure!(leaf < EXTENT_MAP_CAPACITY, "table extent directory exhausted");
        }
        let slot = self.extent_id_slot(leaf)?;
        slot.store(page_id, Ordering::Release);
        // SAFETY: the slot lives in the mapped segment head.
        unsafe { pmem::flush(slot as *const AtomicU32 as *const u8, size_of::<u32>()) };
        pmem::sfence();

        self.bump_max_extent_id(leaf)?;
        Ok(())
    }

    fn bump_max_extent_id(&self, leaf: u32) -> Result<()> {
        let max = self.max_extent_id()?;
        let mut current = max.load(Ordering::Relaxed);
        while current < leaf {
            match max.compare_exchange(current, leaf, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // SAFETY: counter lives in the mapped segment head.
        unsafe { pmem::flush(max as *const AtomicU32 as *const u8, size_of::<u32>()) };
        pmem::sfence();
        Ok(())
    }
}
