//! # Undo Engine
//!
//! The undo engine is the durability half of MVCC: per-thread PM segments
//! holding transaction slots and undo records, a registry that binds
//! worker threads to segments, and the rollback machinery shared by abort
//! and crash recovery.
//!
//! ## TxSlot Pointers
//!
//! A TSP packs a segment id and a slot id into 32 bits:
//!
//! ```text
//! 31          22 21                    0
//! +------------+-----------------------+
//! | segment id | slot id (low 22 bits) |
//! +------------+-----------------------+
//! ```
//!
//! Because TSPs fit in 32 bits they always have a clear MSB as a u64,
//! which is what lets a tuple's `tx_info` discriminate them from CSNs.
//!
//! ## Segment Binding
//!
//! A thread attaches to one segment for as long as it keeps writing; the
//! binding pins the thread to the NUMA node the segment's directory lives
//! on. Attachment clock-sweeps the registry for a free, non-full segment
//! on the local node (falling back to remote nodes when the local stripe
//! is exhausted) and CASes its status word from free to in-use.

pub mod reclaim;
pub mod record;
pub mod segment;

use std::sync::atomic::{fence, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::constants::{
    MIN_TX_CSN, TSP_SLOT_BITS, TSP_SLOT_MASK, WATERMARK_SEGMENT_SIZE,
};
use crate::config::DirectoryConfig;
use crate::db::DbInner;
use crate::heap::tuple::RowId;
use crate::pmem;
use crate::storage::LogicFile;
use crate::undo::record::{undo_ptr_offset, undo_ptr_segment, UndoRecPtr, UndoRecord};
use crate::undo::segment::{TxSlotStatus, UndoSegment};

pub fn make_tsp(segment_id: u32, slot_id: u64) -> u32 {
    (segment_id << TSP_SLOT_BITS) | (slot_id as u32 & TSP_SLOT_MASK)
}

pub fn tsp_segment(tsp: u32) -> u32 {
    tsp >> TSP_SLOT_BITS
}

pub fn tsp_slot(tsp: u32) -> u64 {
    (tsp & TSP_SLOT_MASK) as u64
}

/// What a TSP resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSlotView {
    /// The slot was recycled: the transaction committed at or below the
    /// segment's min snapshot, hence below every live snapshot.
    Recycled,
    Slot { status: TxSlotStatus, csn: u64 },
}

const SEG_FREE: u8 = 0;
const SEG_IN_USE: u8 = 1;
const SEG_UNINIT: u8 = 2;

const ATTACH_RETRIES: usize = 1000;

/// Registry of every undo segment plus the thread-attachment protocol.
pub struct UndoSet {
    segments: Vec<Arc<UndoSegment>>,
    allocated: Vec<AtomicU8>,
    clock_sweep: Mutex<u64>,
    node_counter: AtomicU32,
    dir_config: Arc<DirectoryConfig>,
}

impl UndoSet {
    fn build(
        dir_config: Arc<DirectoryConfig>,
        count: usize,
        segment_size: usize,
    ) -> Result<Vec<Arc<UndoSegment>>> {
        ensure!(count > 0, "at least one undo segment is required");
        ensure!(
            count <= 1usize << crate::config::constants::TSP_SEGMENT_BITS,
            "{} undo segments exceed the TSP segment space",
            count
        );
        let mut segments = Vec::with_capacity(count);
        for id in 0..count {
            let home = dir_config.dir_by_index(id).to_path_buf();
            segments.push(Arc::new(UndoSegment::new(home, id as u32, segment_size)?));
        }
        Ok(segments)
    }

    /// Format every undo segment (fresh store).
    pub fn create(
        dir_config: Arc<DirectoryConfig>,
        count: usize,
        segment_size: usize,
    ) -> Result<Self> {
        let segments = Self::build(dir_config.clone(), count, segment_size)?;
        for segment in &segments {
            segment.create()?;
        }
        info!(count, "created undo segments");
        Ok(Self {
            allocated: (0..count).map(|_| AtomicU8::new(SEG_FREE)).collect(),
            segments,
            clock_sweep: Mutex::new(0),
            node_counter: AtomicU32::new(0),
            dir_config,
        })
    }

    /// Mount every undo segment of an existing store. Segments start
    /// uninitialized until recovery has scanned them.
    pub fn mount(
        dir_config: Arc<DirectoryConfig>,
        count: usize,
        segment_size: usize,
    ) -> Result<Self> {
        let segments = Self::build(dir_config.clone(), count, segment_size)?;
        for segment in &segments {
            segment.mount()?;
        }
        info!(count, "mounted undo segments");
        Ok(Self {
            allocated: (0..count).map(|_| AtomicU8::new(SEG_UNINIT)).collect(),
            segments,
            clock_sweep: Mutex::new(0),
            node_counter: AtomicU32::new(0),
            dir_config,
        })
    }

    pub fn count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, idx: usize) -> &Arc<UndoSegment> {
        &self.segments[idx]
    }

    /// Next NUMA node for a freshly seen thread, round-robin over the PM
    /// directories.
    pub fn next_node(&self) -> usize {
        self.node_counter.fetch_add(1, Ordering::Relaxed) as usize
            % self.dir_config.dir_count()
    }

    /// Recovery step 1 over the whole set: arm every segment's recovery
    /// window, collect the largest committed CSN, and mark the segments
    /// attachable.
    pub fn check_recover_watermark(&self) -> u64 {
        let mut max_csn = MIN_TX_CSN;
        for (idx, segment) in self.segments.iter().enumerate() {
            if self.allocated[idx].load(Ordering::Acquire) != SEG_UNINIT {
                continue;
            }
            max_csn = max_csn.max(segment.max_csn_for_rollback());
            self.allocated[idx].store(SEG_FREE, Ordering::Release);
        }
        max_csn
    }

    /// Bind the calling context to a free, non-full segment, preferring
    /// the given NUMA node's directory. Blocks briefly and retries while
    /// every candidate is taken; a store that is truly out of undo space
    /// errors out.
    pub fn attach(&self, node: usize) -> Result<usize> {
        for attempt in 0..ATTACH_RETRIES {
            {
                let mut sweep = self.clock_sweep.lock();
                // Pass 1: NUMA-local. Pass 2 (same sweep, later attempts):
                // any directory.
                for allow_remote in [false, true] {
                    for _ in 0..self.segments.len() {
                        *sweep += 1;
                        let idx = (*sweep % self.segments.len() as u64) as usize;
                        if self.allocated[idx].load(Ordering::Acquire) != SEG_FREE {
                            continue;
                        }
                        if !allow_remote && self.dir_config.dir_id_by_index(idx) != node {
                            continue;
                        }
                        if self.segments[idx].is_full() {
                            continue;
                        }
                        if self.allocated[idx]
                            .compare_exchange(
                                SEG_FREE,
                                SEG_IN_USE,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            debug!(segment = idx, node, "attached undo segment");
                            return Ok(idx);
                        }
                    }
                }
            }
            if attempt + 1 < ATTACH_RETRIES {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        bail!("no free undo segment after {} attempts", ATTACH_RETRIES)
    }

    pub fn detach(&self, idx: usize) {
        self.allocated[idx].store(SEG_FREE, Ordering::Release);
    }

    pub fn is_attachable_for_recycle(&self, idx: usize) -> bool {
        self.allocated[idx].load(Ordering::Acquire) == SEG_FREE
    }

    /// Resolve a TSP to its transaction state. Pairs with the seq-cst
    /// fence in `recycle_tx_slot`: slot fields are read first, then
    /// `min_slot_id` re-checked, so a recycled (possibly reused) slot is
    /// never trusted.
    pub fn read_tx_slot(&self, tsp: u32) -> TxSlotView {
        let segment = &self.segments[tsp_segment(tsp) as usize];
        let slot_id = tsp_slot(tsp);
        if slot_id < segment.min_slot_id() {
            return TxSlotView::Recycled;
        }
        let slot = segment.slot(slot_id);
        let status = slot.status();
        let csn = slot.csn();
        fence(Ordering::SeqCst);
        if slot_id < segment.min_slot_id() {
            return TxSlotView::Recycled;
        }
        TxSlotView::Slot { status, csn }
    }

    /// Fetch one undo record by pointer.
    pub fn read_record(&self, ptr: UndoRecPtr) -> Result<UndoRecord> {
        let segment = &self.segments[undo_ptr_segment(ptr) as usize];
        segment.read_record_at(undo_ptr_offset(ptr))
    }

    pub fn unmount_all(&self) {
        for segment in &self.segments {
            segment.unmount();
        }
    }
}

/// Roll a transaction's effects back by applying its undo records newest
/// first, then mark the slot rolled back. Returns the rowids of undone
/// inserts so a live abort can recycle them thread-locally.
pub(crate) fn rollback_slot(
    db: &DbInner,
    segment: &UndoSegment,
    slot_id: u64,
) -> Result<Vec<(u32, RowId)>> {
    let records = segment.slot_records(slot_id)?;
    let mut freed = Vec::new();
    for record in records.iter().rev() {
        let row_len = record.row_len()?;
        let map = db.row_map(record.seg_head, row_len)?;
        if let Some(addr) = map.mgr().tuple_addr(record.row_id, false)? {
            // SAFETY: the record was captured from this exact slot; the
            // tuple stays mapped for the life of the store.
            unsafe { record.apply_to_pm(addr)? };
        }
        if record.undo_type == record::UndoType::Insert {
            freed.push((record.seg_head, record.row_id));
        }
    }
    segment.mark_rolled_back(slot_id);
    Ok(freed)
}

/// Bump the run watermark on directory 0 and return this run's base CSN:
/// `MIN_TX_CSN + (run << 32)`.
pub fn bump_watermark(dir_config: &Arc<DirectoryConfig>) -> Result<u64> {
    let home = Arc::new(DirectoryConfig::single(dir_config.dir_by_index(0).to_path_buf()));
    let file = LogicFile::new(home, "watermark", WATERMARK_SEGMENT_SIZE, 1, true)?;
    let base = file.segment_base(0)?;
    // SAFETY: the watermark file is mapped, 8-aligned at its base, and
    // only touched under process startup (single-threaded).
    let counter = unsafe { &*(base as *const AtomicU64) };
    let run = counter.load(Ordering::Relaxed) + 1;
    counter.store(run, Ordering::Release);
    // SAFETY: counter is the first word of the mapped file.
    unsafe { pmem::flush(base, size_of::<u64>()) };
    pmem::sfence();
    info!(run, "bumped run watermark");
    file.unmount();
    Ok(MIN_TX_CSN + (run << 32))
}
