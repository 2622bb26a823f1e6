//! # Undo Segment
//!
//! Each worker thread owns one undo segment while attached. The segment is
//! a LogicFile pinned to the thread's NUMA directory:
//!
//! ```text
//! offset 0        header page (cursors, recovery window, min snapshot)
//! offset 4096     TxSlot ring: UNDO_TX_SLOTS slots of 32 bytes
//! offset 135168   undo records, variable length, appended forever
//! ```
//!
//! Record offsets increase monotonically; whole record segments whose
//! transactions have all become unreachable are punched (renamed to fresh
//! trailing indexes) and their physical files are reused when the offset
//! space reaches the new index.
//!
//! ## Single Writer, Concurrent Readers
//!
//! Only the owning thread allocates slots and appends records. The
//! reclaimer recycles from the other end, and any thread may read TxSlots
//! while resolving a tuple's `tx_info`. The recycle path publishes
//! `min_slot_id` and then issues a sequentially consistent fence before
//! slot memory is reused; a reader that loads slot fields and then
//! re-checks `min_slot_id` (after its own fence) either saw a live slot or
//! detects the recycle and treats the transaction as an old committed one
//! (its CSN is at or below `min_snapshot`, hence below every live
//! snapshot).
//!
//! ## Durability Points
//!
//! - record bytes: flushed by the append before the slot's `end` advances
//! - `end`: flushed per append, so an in-progress transaction's record
//!   range is always recoverable
//! - `csn` + `status`: flushed together by `mark_committed` before commit
//!   returns

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use tracing::debug;

use crate::config::constants::{
    MIN_TX_CSN, PAGE_SIZE, RECYCLE_SLOT_OFFSET, UNDO_MAX_SEGMENTS, UNDO_RECORD_HEADROOM_SEGMENTS,
    UNDO_SLOT_BASE, UNDO_SLOT_HEADROOM, UNDO_TX_SLOTS,
};
use crate::config::DirectoryConfig;
use crate::pmem;
use crate::storage::LogicFile;
use crate::undo::record::{make_undo_ptr, undo_ptr_offset, UndoRecord, UndoRecPtr};

const UNDO_MAGIC: u64 = u64::from_le_bytes(*b"pmheapun");

pub const TX_SLOT_SIZE: usize = 32;

/// First record byte: header page + slot ring, page aligned.
pub const UNDO_RECORD_BASE: u64 =
    (UNDO_SLOT_BASE + UNDO_TX_SLOTS as usize * TX_SLOT_SIZE) as u64;

const _: () = assert!(UNDO_RECORD_BASE % PAGE_SIZE as u64 == 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TxSlotStatus {
    Empty = 0,
    InProgress = 1,
    Committed = 2,
    RollBacked = 3,
}

impl TxSlotStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::InProgress,
            2 => Self::Committed,
            3 => Self::RollBacked,
            _ => Self::Empty,
        }
    }
}

/// PM-resident transaction slot.
#[repr(C)]
pub struct TxSlot {
    status: AtomicU32,
    _pad: u32,
    csn: AtomicU64,
    start: AtomicU64,
    end: AtomicU64,
}

const _: () = assert!(size_of::<TxSlot>() == TX_SLOT_SIZE);

impl TxSlot {
    pub fn status(&self) -> TxSlotStatus {
        TxSlotStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn csn(&self) -> u64 {
        self.csn.load(Ordering::Acquire)
    }

    pub fn start(&self) -> UndoRecPtr {
        self.start.load(Ordering::Acquire)
    }

    pub fn end(&self) -> UndoRecPtr {
        self.end.load(Ordering::Acquire)
    }

    fn flush(&self) {
        // SAFETY: slots overlay mapped PM.
        unsafe { pmem::flush(self as *const TxSlot as *const u8, TX_SLOT_SIZE) };
    }
}

#[repr(C)]
struct UndoSegmentHeader {
    magic: u64,
    next_free_slot: AtomicU64,
    next_recycle_slot: AtomicU64,
    min_slot_id: AtomicU64,
    recovery_start: AtomicU64,
    recovery_end: AtomicU64,
    recycled_begin: AtomicU64,
    min_snapshot: AtomicU64,
    next_record_offset: AtomicU64,
}

pub struct UndoSegment {
    id: u32,
    file: LogicFile,
}

impl UndoSegment {
    /// Open the undo logic file `undo<id>` in its home directory, creating
    /// files on demand.
    pub fn new(home_dir: std::path::PathBuf, id: u32, segment_size: usize) -> Result<Self> {
        ensure!(
            segment_size as u64 > UNDO_RECORD_BASE + PAGE_SIZE as u64,
            "undo segment size {} leaves no record space",
            segment_size
        );
        let config = Arc::new(DirectoryConfig::single(home_dir));
        let file = LogicFile::new(
            config,
            format!("undo{id}"),
            segment_size,
            UNDO_MAX_SEGMENTS,
            true,
        )?;
        Ok(Self { id, file })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn header(&self) -> &UndoSegmentHeader {
        // SAFETY: segment 0 is mounted for the life of self (LogicFile
        // never unmaps before unmount), page-aligned, and larger than the
        // header; all fields are u64/atomics valid for any bit pattern.
        unsafe {
            &*(self
                .file
                .segment_base(0)
                .expect("undo segment 0 is mounted at construction")
                as *const UndoSegmentHeader)
        }
    }

    fn init_header(&self) {
        let header = self.header();
        header.next_free_slot.store(0, Ordering::Relaxed);
        header.next_recycle_slot.store(0, Ordering::Relaxed);
        header.min_slot_id.store(0, Ordering::Relaxed);
        header.recovery_start.store(0, Ordering::Relaxed);
        header.recovery_end.store(0, Ordering::Relaxed);
        header.recycled_begin.store(UNDO_RECORD_BASE, Ordering::Relaxed);
        header.min_snapshot.store(MIN_TX_CSN, Ordering::Relaxed);
        header.next_record_offset.store(UNDO_RECORD_BASE, Ordering::Relaxed);
        // SAFETY: header overlays mapped PM; magic is the first field.
        unsafe {
            let base = self.file.segment_base(0).unwrap();
            (base as *mut u64).write(UNDO_MAGIC);
            pmem::flush(base, size_of::<UndoSegmentHeader>());
        }
        pmem::sfence();
    }

    /// Format a fresh segment.
    pub fn create(&self) -> Result<()> {
        self.init_header();
        Ok(())
    }

    /// Attach to an existing segment: mount every file and rebuild the
    /// record cursor from the last allocated slot. A segment whose header
    /// carries no magic (file created by this mount) is formatted fresh.
    pub fn mount(&self) -> Result<()> {
        self.file.mount_all()?;
        let header = self.header();
        if header.magic != UNDO_MAGIC {
            self.init_header();
            return Ok(());
        }
        let next_free = header.next_free_slot.load(Ordering::Relaxed);
        if next_free > 0 {
            let slot = self.slot(next_free - 1);
            let durable_end = match slot.end() {
                0 => undo_ptr_offset(slot.start()),
                end => undo_ptr_offset(end),
            };
            let cursor = header.next_record_offset.load(Ordering::Relaxed);
            header
                .next_record_offset
                .store(cursor.max(durable_end), Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn unmount(&self) {
        self.file.unmount();
    }

    fn slot_addr(&self, slot_id: u64) -> *mut u8 {
        let ring_offset = (slot_id % UNDO_TX_SLOTS) as usize * TX_SLOT_SIZE;
        // SAFETY: the slot ring lies wholly within mounted segment 0.
        unsafe {
            self.file
                .segment_base(0)
                .expect("undo segment 0 is mounted at construction")
                .add(UNDO_SLOT_BASE + ring_offset)
        }
    }

    /// Slot view by monotonic slot id (ring addressed).
    pub fn slot(&self, slot_id: u64) -> &TxSlot {
        // SAFETY: slot_addr stays within segment 0 and is 8-aligned
        // (UNDO_SLOT_BASE and TX_SLOT_SIZE are multiples of 8).
        unsafe { &*(self.slot_addr(slot_id) as *const TxSlot) }
    }

    pub fn min_slot_id(&self) -> u64 {
        self.header().min_slot_id.load(Ordering::Acquire)
    }

    pub fn min_snapshot(&self) -> u64 {
        self.header().min_snapshot.load(Ordering::Relaxed)
    }

    pub fn next_free_slot(&self) -> u64 {
        self.header().next_free_slot.load(Ordering::Acquire)
    }

    pub fn next_recycle_slot(&self) -> u64 {
        self.header().next_recycle_slot.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.next_free_slot() == 0
    }

    /// A full segment stops taking new transactions: the slot ring is
    /// nearly exhausted or too many record bytes are in flight.
    pub fn is_full(&self) -> bool {
        let header = self.header();
        let free = header.next_free_slot.load(Ordering::Relaxed);
        let recycle = header.next_recycle_slot.load(Ordering::Relaxed);
        if free - recycle >= UNDO_TX_SLOTS - UNDO_SLOT_HEADROOM {
            return true;
        }
        let offset = header.next_record_offset.load(Ordering::Relaxed);
        let begin = header.recycled_begin.load(Ordering::Relaxed);
        offset - begin >= UNDO_RECORD_HEADROOM_SEGMENTS * self.file.segment_size() as u64
    }

    /// Allocate the next TxSlot for the owning thread.
    pub fn allocate_tx_slot(&self) -> u64 {
        let header = self.header();
        let slot_id = header.next_free_slot.load(Ordering::Relaxed);
        let slot = self.slot(slot_id);
        slot.csn.store(0, Ordering::Relaxed);
        slot.end.store(0, Ordering::Relaxed);
        let start = make_undo_ptr(self.id, header.next_record_offset.load(Ordering::Relaxed));
        slot.start.store(start, Ordering::Relaxed);
        slot.status
            .store(TxSlotStatus::InProgress as u32, Ordering::Release);
        slot.flush();
        pmem::sfence();

        header.next_free_slot.store(slot_id + 1, Ordering::Release);
        // SAFETY: the counter lives in the mounted header.
        unsafe {
            pmem::flush(
                &header.next_free_slot as *const AtomicU64 as *const u8,
                size_of::<AtomicU64>(),
            );
        }
        pmem::sfence();
        slot_id
    }

    /// Append one undo record for `slot_id` (the owning thread's current
    /// slot). The record bytes are durable and the slot's `end` covers
    /// them before this returns.
    pub fn append_record(&self, slot_id: u64, record: &UndoRecord) -> Result<UndoRecPtr> {
        let header = self.header();
        let offset = header.next_record_offset.load(Ordering::Relaxed);
        let bytes = record.encode();
        self.file.seek_and_write(offset, &bytes)?;

        let end = offset + bytes.len() as u64;
        header.next_record_offset.store(end, Ordering::Relaxed);
        let slot = self.slot(slot_id);
        slot.end.store(make_undo_ptr(self.id, end), Ordering::Release);
        slot.flush();
        pmem::sfence();
        Ok(make_undo_ptr(self.id, offset))
    }

    /// Commit: csn before status, one flush, one fence.
    pub fn mark_committed(&self, slot_id: u64, csn: u64) {
        let slot = self.slot(slot_id);
        slot.csn.store(csn, Ordering::Release);
        slot.status
            .store(TxSlotStatus::Committed as u32, Ordering::Release);
        slot.flush();
        pmem::sfence();
    }

    pub fn mark_rolled_back(&self, slot_id: u64) {
        let slot = self.slot(slot_id);
        slot.status
            .store(TxSlotStatus::RollBacked as u32, Ordering::Release);
        slot.flush();
        pmem::sfence();
    }

    pub fn is_slot_recyclable(&self, slot_id: u64, min_snapshot: u64) -> bool {
        let slot = self.slot(slot_id);
        match slot.status() {
            TxSlotStatus::Empty | TxSlotStatus::RollBacked => true,
            TxSlotStatus::Committed => slot.csn() <= min_snapshot,
            TxSlotStatus::InProgress => false,
        }
    }

    /// Read one record at a byte offset of this segment's record space.
    pub fn read_record_at(&self, offset: u64) -> Result<UndoRecord> {
        let mut head = [0u8; crate::undo::record::UNDO_RECORD_HEADER_SIZE];
        self.file.seek_and_read(offset, &mut head)?;
        let payload_len = u32::from_le_bytes(head[20..24].try_into().unwrap()) as usize;
        let mut buf = vec![0u8; head.len() + payload_len];
        self.file.seek_and_read(offset, &mut buf)?;
        UndoRecord::decode(&buf)
    }

    /// Decode every record of `slot_id`, in append order.
    pub fn slot_records(&self, slot_id: u64) -> Result<Vec<UndoRecord>> {
        let slot = self.slot(slot_id);
        let end_ptr = slot.end();
        if end_ptr == 0 {
            return Ok(Vec::new());
        }
        let mut cursor = undo_ptr_offset(slot.start());
        let end = undo_ptr_offset(end_ptr);
        let mut records = Vec::new();
        while cursor < end {
            let record = self.read_record_at(cursor)?;
            cursor += record.encoded_len() as u64;
            records.push(record);
        }
        Ok(records)
    }

    /// Recycle every leading reclaimable slot. Invoked by the reclaimer
    /// only; the ordering inside is the crux: concurrent TSP readers must
    /// observe `min_slot_id` advanced before any slot or record byte is
    /// reused.
    pub fn recycle_tx_slot(&self, min_snapshot: u64) -> Result<()> {
        let header = self.header();
        let begin = header.next_recycle_slot.load(Ordering::Relaxed);
        let max = header.next_free_slot.load(Ordering::Relaxed);
        let mut next = begin;
        while next < max && self.is_slot_recyclable(next, min_snapshot) {
            next += 1;
        }
        if next == begin {
            return Ok(());
        }

        if next + RECYCLE_SLOT_OFFSET >= max {
            // Recovery bootstraps its CSN floor from this when the segment
            // is otherwise drained.
            header.min_snapshot.store(min_snapshot, Ordering::Relaxed);
        }

        header.min_slot_id.store(next, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let next = header.min_slot_id.load(Ordering::Relaxed);

        self.recycle_undo_pages(begin, next - 1)?;

        let begin_off = begin % UNDO_TX_SLOTS;
        let end_off = next % UNDO_TX_SLOTS;
        if begin_off < end_off {
            self.zero_slots(begin_off, end_off - begin_off);
        } else {
            self.zero_slots(begin_off, UNDO_TX_SLOTS - begin_off);
            self.zero_slots(0, end_off);
        }

        header.next_recycle_slot.store(next, Ordering::Release);
        // SAFETY: cursor fields live in the mounted header.
        unsafe {
            pmem::flush(
                &header.next_recycle_slot as *const AtomicU64 as *const u8,
                size_of::<AtomicU64>(),
            );
        }
        pmem::sfence();
        debug!(segment = self.id, from = begin, to = next, "recycled tx slots");
        Ok(())
    }

    fn zero_slots(&self, ring_offset: u64, count: u64) {
        for i in 0..count {
            let slot = self.slot(ring_offset + i);
            slot.status.store(0, Ordering::Relaxed);
            slot.csn.store(0, Ordering::Relaxed);
            slot.start.store(0, Ordering::Relaxed);
            slot.end.store(0, Ordering::Relaxed);
            slot.flush();
        }
        pmem::sfence();
    }

    /// Punch every record segment wholly covered by the slots in
    /// `[begin_slot, end_slot]`. Segment 0 holds the header and slot ring
    /// and is never punched.
    fn recycle_undo_pages(&self, begin_slot: u64, end_slot: u64) -> Result<()> {
        let header = self.header();
        let segment_size = self.file.segment_size() as u64;
        let mut start_segment = header.recycled_begin.load(Ordering::Relaxed) / segment_size;
        let mut end_segment = 0;
        let mut recycled_end = 0;

        debug_assert!(begin_slot <= end_slot);
        for slot_id in begin_slot..=end_slot {
            let slot = self.slot(slot_id);
            if slot.start() == 0 || slot.end() == 0 {
                continue;
            }
            recycled_end = undo_ptr_offset(slot.end());
            end_segment = recycled_end / segment_size;
        }

        if start_segment == 0 {
            start_segment = 1;
        }
        if start_segment < end_segment {
            header.recycled_begin.store(recycled_end, Ordering::Relaxed);
            self.file.punch(start_segment as usize, end_segment as usize)?;
        }
        Ok(())
    }

    /// Recovery step 1: scan the last allocated slot(s) for the largest
    /// committed CSN and arm the recovery window. A non-zero stored window
    /// start means the previous recovery itself crashed; it is kept.
    pub fn max_csn_for_rollback(&self) -> u64 {
        let header = self.header();
        if self.is_empty() {
            return header.min_snapshot.load(Ordering::Relaxed);
        }
        let slot_end = header.next_free_slot.load(Ordering::Relaxed) - 1;
        let slot_begin = slot_end.saturating_sub(1);
        let mut max_csn = 0;
        for slot_id in slot_begin..=slot_end {
            let slot = self.slot(slot_id);
            if slot.status() == TxSlotStatus::Committed {
                max_csn = max_csn.max(slot.csn());
            }
        }

        // Only the last slot can still be in progress (a thread finishes
        // slot N before allocating N+1). The stored window start is
        // offset by one so zero keeps meaning "nothing to recover".
        if header.recovery_start.load(Ordering::Relaxed) == 0 {
            header.recovery_start.store(slot_end + 1, Ordering::Relaxed);
        }
        header.recovery_end.store(slot_end, Ordering::Relaxed);
        // SAFETY: recovery fields live in the mounted header.
        unsafe {
            pmem::flush(
                &header.recovery_start as *const AtomicU64 as *const u8,
                2 * size_of::<AtomicU64>(),
            );
        }
        pmem::sfence();
        max_csn
    }

    /// Recovery window armed by [`max_csn_for_rollback`]: inclusive slot
    /// range, or None when nothing is pending.
    ///
    /// [`max_csn_for_rollback`]: UndoSegment::max_csn_for_rollback
    pub fn recovery_window(&self) -> Option<(u64, u64)> {
        let header = self.header();
        let start = header.recovery_start.load(Ordering::Relaxed);
        if start == 0 {
            return None;
        }
        Some((start - 1, header.recovery_end.load(Ordering::Relaxed)))
    }

    /// Recovery step 2 done: disarm the window.
    pub fn clear_recovery_window(&self) {
        let header = self.header();
        header.recovery_start.store(0, Ordering::Relaxed);
        // SAFETY: field lives in the mounted header.
        unsafe {
            pmem::flush(
                &header.recovery_start as *const AtomicU64 as *const u8,
                size_of::<AtomicU64>(),
            );
        }
        pmem::sfence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SEG_SIZE: usize = 256 * 1024;

    fn segment(dir: &std::path::Path) -> UndoSegment {
        let seg = UndoSegment::new(dir.to_path_buf(), 0, SEG_SIZE).unwrap();
        seg.create().unwrap();
        seg
    }

    #[test]
    fn fresh_segment_is_empty_and_not_full() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());

        assert!(seg.is_empty());
        assert!(!seg.is_full());
        assert_eq!(seg.next_free_slot(), 0);
    }

    #[test]
    fn allocate_slot_starts_in_progress() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());

        let slot_id = seg.allocate_tx_slot();

        assert_eq!(slot_id, 0);
        assert_eq!(seg.slot(slot_id).status(), TxSlotStatus::InProgress);
        assert_eq!(seg.next_free_slot(), 1);
        assert_eq!(undo_ptr_offset(seg.slot(slot_id).start()), UNDO_RECORD_BASE);
    }

    #[test]
    fn append_and_read_back_records() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());
        let slot_id = seg.allocate_tx_slot();

        let rec1 = UndoRecord::insert(1, 512, 0, 100);
        let rec2 = UndoRecord::insert(1, 512, 1, 100);
        let ptr1 = seg.append_record(slot_id, &rec1).unwrap();
        let ptr2 = seg.append_record(slot_id, &rec2).unwrap();

        assert!(undo_ptr_offset(ptr2) > undo_ptr_offset(ptr1));
        let records = seg.slot_records(slot_id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].row_id, 0);
        assert_eq!(records[1].row_id, 1);
    }

    #[test]
    fn mark_committed_publishes_csn_then_status() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());
        let slot_id = seg.allocate_tx_slot();

        seg.mark_committed(slot_id, MIN_TX_CSN + 10);

        let slot = seg.slot(slot_id);
        assert_eq!(slot.status(), TxSlotStatus::Committed);
        assert_eq!(slot.csn(), MIN_TX_CSN + 10);
    }

    #[test]
    fn recyclable_truth_table() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());
        let s0 = seg.allocate_tx_slot();
        let s1 = seg.allocate_tx_slot();
        let s2 = seg.allocate_tx_slot();
        seg.mark_committed(s0, MIN_TX_CSN + 5);
        seg.mark_rolled_back(s1);

        let min = MIN_TX_CSN + 7;
        assert!(seg.is_slot_recyclable(s0, min));
        assert!(seg.is_slot_recyclable(s1, min));
        assert!(!seg.is_slot_recyclable(s2, min)); // still in progress
        assert!(!seg.is_slot_recyclable(s0, MIN_TX_CSN + 4)); // csn above min
    }

    #[test]
    fn recycle_advances_cursor_and_zeroes_slots() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());
        for i in 0..3 {
            let slot = seg.allocate_tx_slot();
            let rec = UndoRecord::insert(slot as u32, 512, i, 64);
            seg.append_record(slot, &rec).unwrap();
            seg.mark_committed(slot, MIN_TX_CSN + 1 + i as u64);
        }

        seg.recycle_tx_slot(MIN_TX_CSN + 100).unwrap();

        assert_eq!(seg.next_recycle_slot(), 3);
        assert_eq!(seg.min_slot_id(), 3);
        for i in 0..3 {
            assert_eq!(seg.slot(i).status(), TxSlotStatus::Empty);
            assert_eq!(seg.slot(i).start(), 0);
        }
        // Cursor proximity to next_free_slot wrote the snapshot back.
        assert_eq!(seg.min_snapshot(), MIN_TX_CSN + 100);
    }

    #[test]
    fn recycle_stops_at_in_progress_slot() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());
        let s0 = seg.allocate_tx_slot();
        seg.mark_committed(s0, MIN_TX_CSN + 1);
        let _s1 = seg.allocate_tx_slot();

        seg.recycle_tx_slot(MIN_TX_CSN + 100).unwrap();

        assert_eq!(seg.next_recycle_slot(), 1);
        assert_eq!(seg.slot(1).status(), TxSlotStatus::InProgress);
    }

    #[test]
    fn recycle_punches_consumed_record_segments() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());

        // Write enough records to spill past segment 1 of the record
        // space, all committed and reclaimable.
        let payload_rows = 2 * SEG_SIZE / 1024;
        for i in 0..payload_rows {
            let slot = seg.allocate_tx_slot();
            let header = crate::heap::tuple::HeaderSnapshot {
                tx_info: MIN_TX_CSN + i as u64,
                prev: 0,
                is_used: true,
                is_deleted: false,
                data_size: 1000,
            };
            let rec = UndoRecord::delete(slot as u32, 512, i as u32, &header, &[0u8; 1000]);
            seg.append_record(slot, &rec).unwrap();
            seg.mark_committed(slot, MIN_TX_CSN + 1 + i as u64);
        }
        let segments_before = seg.file.segment_count();
        assert!(segments_before > 1);

        seg.recycle_tx_slot(MIN_TX_CSN + payload_rows as u64 + 10).unwrap();

        // Old record segments were renamed past the previous tail.
        assert!(seg.file.segment_table_len() > segments_before);
        assert!(seg.file.segment_base(1).is_err());
    }

    #[test]
    fn max_csn_for_rollback_arms_recovery_window() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());
        let s0 = seg.allocate_tx_slot();
        seg.mark_committed(s0, MIN_TX_CSN + 3);
        let s1 = seg.allocate_tx_slot();
        let rec = UndoRecord::insert(s1 as u32, 512, 0, 64);
        seg.append_record(s1, &rec).unwrap();

        let max = seg.max_csn_for_rollback();

        assert_eq!(max, MIN_TX_CSN + 3);
        assert_eq!(seg.recovery_window(), Some((1, 1)));

        seg.clear_recovery_window();
        assert_eq!(seg.recovery_window(), None);
    }

    #[test]
    fn max_csn_for_rollback_covers_a_lone_first_slot() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());
        let s0 = seg.allocate_tx_slot();
        let rec = UndoRecord::insert(s0 as u32, 512, 0, 64);
        seg.append_record(s0, &rec).unwrap();

        seg.max_csn_for_rollback();

        assert_eq!(seg.recovery_window(), Some((0, 0)));
    }

    #[test]
    fn remount_rebuilds_the_record_cursor() {
        let dir = tempdir().unwrap();
        let end;
        {
            let seg = segment(dir.path());
            let slot = seg.allocate_tx_slot();
            seg.append_record(slot, &UndoRecord::insert(0, 512, 0, 64)).unwrap();
            end = undo_ptr_offset(seg.slot(slot).end());
            seg.unmount();
        }
        let seg = UndoSegment::new(dir.path().to_path_buf(), 0, SEG_SIZE).unwrap();
        seg.mount().unwrap();

        assert_eq!(
            seg.header().next_record_offset.load(Ordering::Relaxed),
            end
        );
        assert_eq!(seg.next_free_slot(), 1);
    }

    #[test]
    fn segment_reports_full_when_record_space_runs_ahead() {
        let dir = tempdir().unwrap();
        let seg = segment(dir.path());
        let header = seg.header();
        header.next_record_offset.store(
            UNDO_RECORD_BASE + UNDO_RECORD_HEADROOM_SEGMENTS * SEG_SIZE as u64,
            Ordering::Relaxed,
        );
        assert!(seg.is_full());
    }
}
