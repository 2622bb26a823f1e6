//! # pmheap Configuration Constants
//!
//! This module centralizes the layout and sizing constants of the store.
//! Constants that depend on each other are co-located and the dependencies
//! are documented so a change in one place does not silently break another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> EXTENT_SIZE (2 MiB, must be a multiple of PAGE_SIZE)
//!       │     │
//!       │     ├─> EXTENT_HEADER_SIZE (64 bytes, one cache line)
//!       │     └─> tuples_per_extent = (EXTENT_SIZE - EXTENT_HEADER_SIZE) / tuple_len
//!       │
//!       └─> UNDO_SLOT_BASE (slots start on the second page of an undo segment)
//!
//! TUPLE_HEADER_SIZE (24 bytes)
//!       │
//!       └─> tuple slot width = round_up(TUPLE_HEADER_SIZE + row_len, 8)
//!             The 8-byte rounding keeps `tx_info` at an aligned offset so
//!             commit write-back is a single aligned atomic store.
//!
//! UNDO_TX_SLOTS (4096, power of two)
//!       │
//!       ├─> UNDO_RECORD_BASE (first record byte, after header page + slot ring)
//!       └─> UNDO_SLOT_HEADROOM (ring considered full this many slots early)
//!
//! TSP_SLOT_BITS (22) + TSP_SEGMENT_BITS (10) = 32
//!       A TxSlot pointer must fit in 32 bits so the MSB of `tx_info`
//!       can discriminate TSP (0) from CSN (1).
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `EXTENT_SIZE % PAGE_SIZE == 0`
//! 2. `UNDO_TX_SLOTS.is_power_of_two()`
//! 3. `TSP_SEGMENT_BITS + TSP_SLOT_BITS == 32`
//! 4. `MIN_TX_CSN` has the top bit set; no TSP ever does.

/// Base page size of every PM file. Segment sizes and extent sizes are
/// multiples of this.
pub const PAGE_SIZE: usize = 4096;

/// CPU cache line, the flush granularity of the PM primitives.
pub const CACHE_LINE_SIZE: usize = 64;

/// Heap extent: the unit of tablespace allocation and NUMA striping.
pub const EXTENT_SIZE: usize = 2 * 1024 * 1024;

/// Reserved bytes at the start of every extent (one cache line).
pub const EXTENT_HEADER_SIZE: usize = 64;

/// On-PM tuple header: tx_info(8) + prev(8) + is_used(1) + is_deleted(1) +
/// pad(2) + data_size(4).
pub const TUPLE_HEADER_SIZE: usize = 24;

/// Hard cap on a table's declared row length.
pub const MAX_TUPLE_LEN: usize = 8192;

/// PM directories map one-to-one to NUMA nodes; at most four sockets.
pub const MAX_NUMA_DIRS: usize = 4;

/// Upper bound on threads concurrently attached to the process array.
pub const MAX_THREADS: usize = 256;

/// Row directory (DRAM) segment: entries per lazily-allocated block.
pub const ROWID_MAP_SEGMENT_LEN: usize = 256 * 1024;

/// Number of level-1 slots in the row directory (rounded up so the last
/// partial segment still covers the top of the rowid space).
pub const ROWID_MAP_SEGMENTS: usize =
    (u32::MAX as usize + ROWID_MAP_SEGMENT_LEN - 1) / ROWID_MAP_SEGMENT_LEN;

/// Reserved invalid row id.
pub const INVALID_ROW_ID: u32 = u32::MAX;

/// Largest allocatable row id.
pub const MAX_ROW_ID: u32 = u32::MAX - 1;

/// TxSlots per undo segment (ring).
pub const UNDO_TX_SLOTS: u64 = 4096;

/// Byte offset of the TxSlot ring inside an undo segment (header page first).
pub const UNDO_SLOT_BASE: usize = PAGE_SIZE;

/// The ring reports full this many slots before true exhaustion so a
/// writer switches segments instead of overwriting live slots.
pub const UNDO_SLOT_HEADROOM: u64 = 64;

/// Bytes of undo records a single segment may have in flight before it
/// reports full, expressed in segment-size units. Recycling punches whole
/// record segments back to the tail.
pub const UNDO_RECORD_HEADROOM_SEGMENTS: u64 = 8;

/// `recycle_tx_slot` writes the min snapshot back into the header only when
/// the recycle cursor is within this many slots of the allocation cursor.
pub const RECYCLE_SLOT_OFFSET: u64 = 2;

/// TSP layout: `(segment_id << TSP_SLOT_BITS) | slot_id`.
pub const TSP_SLOT_BITS: u32 = 22;
pub const TSP_SEGMENT_BITS: u32 = 10;
pub const TSP_SLOT_MASK: u32 = (1 << TSP_SLOT_BITS) - 1;

/// Undo record pointer layout: `(segment_id << UNDO_PTR_OFFSET_BITS) | offset`.
pub const UNDO_PTR_OFFSET_BITS: u32 = 48;
pub const UNDO_PTR_OFFSET_MASK: u64 = (1 << UNDO_PTR_OFFSET_BITS) - 1;

/// Reserved invalid undo record pointer (offset 0 is the segment header).
pub const INVALID_UNDO_PTR: u64 = 0;

/// Smallest commit sequence number. The set top bit is the tx_info
/// discriminator: CSN values live in the upper half of the u64 space,
/// TxSlot pointers fit in 32 bits and live entirely in the lower half.
pub const MIN_TX_CSN: u64 = 1 << 63;

/// "No cached CSN" sentinel for the row entry surrogate key.
pub const INVALID_CSN: u64 = 0;

/// Segment-table reserve for the tablespace logic file.
pub const TABLESPACE_MAX_SEGMENTS: usize = 16 * 1024;

/// Segment-table reserve for each undo logic file. Punch renames freed
/// segments to fresh trailing indexes, so index space outgrows the live
/// segment count over the life of a run.
pub const UNDO_MAX_SEGMENTS: usize = 1024;

/// The watermark file is a single tiny segment on directory 0.
pub const WATERMARK_SEGMENT_SIZE: usize = 1024;

const _: () = assert!(EXTENT_SIZE % PAGE_SIZE == 0);
const _: () = assert!(UNDO_TX_SLOTS.is_power_of_two());
const _: () = assert!(TSP_SEGMENT_BITS + TSP_SLOT_BITS == 32);
const _: () = assert!(UNDO_SLOT_HEADROOM < UNDO_TX_SLOTS);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csn_space_is_disjoint_from_tsp_space() {
        let max_tsp = u32::MAX as u64;
        assert!(max_tsp < MIN_TX_CSN);
        assert_eq!(MIN_TX_CSN >> 63, 1);
    }

    #[test]
    fn rowid_map_covers_the_full_rowid_space() {
        let covered = ROWID_MAP_SEGMENTS as u64 * ROWID_MAP_SEGMENT_LEN as u64;
        assert!(covered >= MAX_ROW_ID as u64);
    }

    #[test]
    fn slot_ring_fits_before_the_record_region() {
        let slot_bytes = UNDO_TX_SLOTS as usize * 32;
        assert!(UNDO_SLOT_BASE + slot_bytes < 8 * 1024 * 1024);
    }
}
