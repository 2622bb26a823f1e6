//! # Tuple Layout and the DRAM Working Copy
//!
//! Every row version on PM is a fixed-width slot: a 24-byte header followed
//! by the row payload, padded so the next slot keeps the header 8-aligned.
//!
//! ## Binary Layout (24-byte header)
//!
//! ```text
//! Offset  Size  Field       Notes
//! 0       8     tx_info     MSB 0: TxSlot pointer (32-bit, in-progress)
//!                           MSB 1: commit sequence number (committed)
//! 8       8     prev        undo record pointer to the prior version
//! 16      1     is_used     slot carries a live row
//! 17      1     is_deleted  visible version is a tombstone
//! 18      2     (pad)
//! 20      4     data_size   payload length, set on serialization
//! ```
//!
//! `tx_info` is the MVCC linchpin: committing a transaction overwrites it
//! in place with the CSN using a single aligned 8-byte store, which is why
//! the slot width is rounded up to 8 bytes.
//!
//! ## PM vs DRAM
//!
//! [`TupleHeader`] overlays the mmap'd bytes and is only ever accessed
//! through atomics — `tx_info` races with commit write-back by design, the
//! remaining fields are serialized by the row entry lock. [`RamTuple`] is
//! the owned DRAM working copy that operations serialize to and from PM;
//! it additionally tracks which byte ranges an update touched so the undo
//! log can capture a delta instead of a full pre-image.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::config::constants::{INVALID_UNDO_PTR, MAX_TUPLE_LEN, TUPLE_HEADER_SIZE};
use crate::pmem;

/// Logical row identifier within a table.
pub type RowId = u32;

/// Width of one row slot on PM: header + payload, kept 8-aligned so
/// `tx_info` of every slot admits an aligned atomic store.
pub fn tuple_slot_len(row_len: u32) -> u32 {
    (TUPLE_HEADER_SIZE as u32 + row_len + 7) & !7
}

/// On-PM tuple header. All access goes through atomics: `tx_info` is
/// written by commit without the entry lock, the rest only under it.
#[repr(C)]
pub struct TupleHeader {
    tx_info: AtomicU64,
    prev: AtomicU64,
    is_used: AtomicU8,
    is_deleted: AtomicU8,
    _pad: [u8; 2],
    data_size: AtomicU32,
}

const _: () = assert!(size_of::<TupleHeader>() == TUPLE_HEADER_SIZE);

impl TupleHeader {
    /// Overlay a header on the PM bytes at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point at a mapped, 8-aligned tuple slot that stays
    /// mapped for `'a` (the store keeps all segments mapped until
    /// shutdown).
    pub unsafe fn from_addr<'a>(addr: *mut u8) -> &'a TupleHeader {
        debug_assert_eq!(addr as usize % 8, 0);
        &*(addr as *const TupleHeader)
    }

    pub fn tx_info(&self) -> u64 {
        self.tx_info.load(Ordering::Acquire)
    }

    pub fn set_tx_info(&self, tx_info: u64) {
        self.tx_info.store(tx_info, Ordering::Release);
    }

    pub fn prev(&self) -> u64 {
        self.prev.load(Ordering::Relaxed)
    }

    pub fn set_prev(&self, prev: u64) {
        self.prev.store(prev, Ordering::Relaxed);
    }

    pub fn is_used(&self) -> bool {
        self.is_used.load(Ordering::Relaxed) != 0
    }

    pub fn set_used(&self, used: bool) {
        self.is_used.store(used as u8, Ordering::Relaxed);
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted.load(Ordering::Relaxed) != 0
    }

    pub fn set_deleted(&self, deleted: bool) {
        self.is_deleted.store(deleted as u8, Ordering::Relaxed);
    }

    pub fn data_size(&self) -> u32 {
        self.data_size.load(Ordering::Relaxed)
    }

    pub fn set_data_size(&self, size: u32) {
        self.data_size.store(size, Ordering::Relaxed);
    }

    /// Copy the header fields out in one pass.
    pub fn snapshot(&self) -> HeaderSnapshot {
        HeaderSnapshot {
            tx_info: self.tx_info(),
            prev: self.prev(),
            is_used: self.is_used(),
            is_deleted: self.is_deleted(),
            data_size: self.data_size(),
        }
    }

    /// Write a full header image. `tx_info` is stored last with release
    /// ordering so a concurrent reader that observes it sees the rest.
    pub fn store(&self, snap: &HeaderSnapshot) {
        self.set_prev(snap.prev);
        self.set_used(snap.is_used);
        self.set_deleted(snap.is_deleted);
        self.set_data_size(snap.data_size);
        self.set_tx_info(snap.tx_info);
    }

    /// Flush the header's cache line(s). Caller fences.
    pub fn flush(&self) {
        // SAFETY: self overlays mapped PM.
        unsafe { pmem::flush(self as *const TupleHeader as *const u8, TUPLE_HEADER_SIZE) };
    }
}

/// Plain owned copy of a tuple header; also its 24-byte wire form inside
/// undo record payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSnapshot {
    pub tx_info: u64,
    pub prev: u64,
    pub is_used: bool,
    pub is_deleted: bool,
    pub data_size: u32,
}

impl HeaderSnapshot {
    pub const WIRE_SIZE: usize = TUPLE_HEADER_SIZE;

    pub fn empty() -> Self {
        Self {
            tx_info: 0,
            prev: INVALID_UNDO_PTR,
            is_used: false,
            is_deleted: false,
            data_size: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.tx_info.to_le_bytes());
        buf[8..16].copy_from_slice(&self.prev.to_le_bytes());
        buf[16] = self.is_used as u8;
        buf[17] = self.is_deleted as u8;
        buf[20..24].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        ensure!(
            buf.len() >= Self::WIRE_SIZE,
            "header image truncated: {} < {}",
            buf.len(),
            Self::WIRE_SIZE
        );
        Ok(Self {
            tx_info: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            prev: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            is_used: buf[16] != 0,
            is_deleted: buf[17] != 0,
            data_size: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }
}

/// A byte range of the row an update touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPatch {
    pub offset: u32,
    pub len: u32,
}

/// DRAM working copy of one row: header image, payload buffer, and the
/// patch list of the in-flight update.
pub struct RamTuple {
    row_len: u32,
    pub header: HeaderSnapshot,
    data: Vec<u8>,
    patches: SmallVec<[RowPatch; 8]>,
}

impl RamTuple {
    pub fn new(row_len: u32) -> Self {
        debug_assert!(row_len as usize <= MAX_TUPLE_LEN);
        Self {
            row_len,
            header: HeaderSnapshot::empty(),
            data: vec![0u8; row_len as usize],
            patches: SmallVec::new(),
        }
    }

    pub fn with_data(row_len: u32, bytes: &[u8]) -> Self {
        let mut tuple = Self::new(row_len);
        tuple.data[..bytes.len()].copy_from_slice(bytes);
        tuple
    }

    pub fn row_len(&self) -> u32 {
        self.row_len
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_used(&self) -> bool {
        self.header.is_used
    }

    pub fn is_deleted(&self) -> bool {
        self.header.is_deleted
    }

    pub fn has_prev_version(&self) -> bool {
        self.header.prev != INVALID_UNDO_PTR
    }

    /// Overwrite the full payload without recording a patch (insert path).
    pub fn set_row(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.row_len as usize);
        self.data.copy_from_slice(bytes);
    }

    /// Write `bytes` at `offset` and record the range for delta undo /
    /// delta write-back.
    pub fn update_range(&mut self, offset: u32, bytes: &[u8]) {
        let end = offset as usize + bytes.len();
        debug_assert!(end <= self.row_len as usize);
        self.data[offset as usize..end].copy_from_slice(bytes);
        self.patches.push(RowPatch {
            offset,
            len: bytes.len() as u32,
        });
    }

    /// Write `bytes` at `offset` without recording a patch (version-chain
    /// rewind).
    pub fn restore_range(&mut self, offset: u32, bytes: &[u8]) {
        let end = offset as usize + bytes.len();
        debug_assert!(end <= self.row_len as usize);
        self.data[offset as usize..end].copy_from_slice(bytes);
    }

    pub fn patches(&self) -> &[RowPatch] {
        &self.patches
    }

    pub fn clear_patches(&mut self) {
        self.patches.clear();
    }

    pub fn patched_len(&self) -> u64 {
        self.patches.iter().map(|p| p.len as u64).sum()
    }

    pub fn init_head(&mut self, tx_info: u64, prev: u64, is_used: bool, is_deleted: bool) {
        self.header = HeaderSnapshot {
            tx_info,
            prev,
            is_used,
            is_deleted,
            data_size: self.row_len,
        };
    }

    /// Write header and payload to the PM slot at `addr`, flush, fence.
    ///
    /// # Safety
    ///
    /// `addr` must point at a mapped tuple slot of at least
    /// `tuple_slot_len(row_len)` bytes, owned by the caller's critical
    /// section.
    pub unsafe fn serialize(&self, addr: *mut u8) {
        let header = TupleHeader::from_addr(addr);
        header.store(&self.header);
        let data_dst = addr.add(TUPLE_HEADER_SIZE);
        std::ptr::copy_nonoverlapping(self.data.as_ptr(), data_dst, self.data.len());
        pmem::flush(addr, TUPLE_HEADER_SIZE + self.data.len());
        pmem::sfence();
    }

    /// Copy only the patched ranges to the PM payload at `data_addr`,
    /// flush them, fence.
    ///
    /// # Safety
    ///
    /// `data_addr` must point at the payload of a mapped tuple slot with
    /// room for `row_len` bytes.
    pub unsafe fn copy_patches_to_nvm(&self, data_addr: *mut u8) {
        for patch in &self.patches {
            let src = &self.data[patch.offset as usize..(patch.offset + patch.len) as usize];
            let dst = data_addr.add(patch.offset as usize);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
            pmem::flush(dst, src.len());
        }
        pmem::sfence();
    }

    /// Load header and payload from the PM slot at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point at a mapped tuple slot of this tuple's width.
    pub unsafe fn deserialize(&mut self, addr: *const u8) {
        let header = TupleHeader::from_addr(addr as *mut u8);
        self.header = header.snapshot();
        let data_src = addr.add(TUPLE_HEADER_SIZE);
        std::ptr::copy_nonoverlapping(data_src, self.data.as_mut_ptr(), self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_len_keeps_headers_aligned() {
        assert_eq!(tuple_slot_len(0), 24);
        assert_eq!(tuple_slot_len(1), 32);
        assert_eq!(tuple_slot_len(8), 32);
        assert_eq!(tuple_slot_len(100), 128);
        assert_eq!(tuple_slot_len(100) % 8, 0);
    }

    #[test]
    fn header_snapshot_wire_roundtrip() {
        let snap = HeaderSnapshot {
            tx_info: 0x8000_0000_0000_1234,
            prev: 0x0001_0000_0000_4242,
            is_used: true,
            is_deleted: false,
            data_size: 100,
        };
        let restored = HeaderSnapshot::from_bytes(&snap.to_bytes()).unwrap();
        assert_eq!(restored, snap);
    }

    #[test]
    fn header_snapshot_rejects_truncated_input() {
        assert!(HeaderSnapshot::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn pm_header_store_and_snapshot() {
        let mut slot = vec![0u64; 16]; // 8-aligned backing
        let addr = slot.as_mut_ptr() as *mut u8;
        let header = unsafe { TupleHeader::from_addr(addr) };

        let snap = HeaderSnapshot {
            tx_info: 77,
            prev: 99,
            is_used: true,
            is_deleted: true,
            data_size: 8,
        };
        header.store(&snap);

        assert_eq!(header.snapshot(), snap);
        assert!(header.is_used());
        assert!(header.is_deleted());
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let row_len = 100u32;
        let mut slot = vec![0u64; (tuple_slot_len(row_len) as usize).div_ceil(8)];
        let addr = slot.as_mut_ptr() as *mut u8;

        let mut tuple = RamTuple::with_data(row_len, &[0x41; 100]);
        tuple.init_head(7, INVALID_UNDO_PTR, true, false);
        unsafe { tuple.serialize(addr) };

        let mut out = RamTuple::new(row_len);
        unsafe { out.deserialize(addr) };
        assert_eq!(out.header.tx_info, 7);
        assert!(out.is_used());
        assert!(!out.is_deleted());
        assert_eq!(out.data(), &[0x41; 100][..]);
    }

    #[test]
    fn update_range_records_patches() {
        let mut tuple = RamTuple::new(64);
        tuple.update_range(4, &[1, 2, 3]);
        tuple.update_range(32, &[9]);

        assert_eq!(tuple.patches().len(), 2);
        assert_eq!(tuple.patched_len(), 4);
        assert_eq!(&tuple.data()[4..7], &[1, 2, 3]);
        assert_eq!(tuple.data()[32], 9);

        tuple.clear_patches();
        assert!(tuple.patches().is_empty());
    }

    #[test]
    fn copy_patches_touches_only_patched_ranges() {
        let row_len = 64u32;
        let mut pm = vec![0xEEu8; row_len as usize];
        let mut tuple = RamTuple::new(row_len);
        tuple.update_range(10, &[1, 2, 3, 4]);

        unsafe { tuple.copy_patches_to_nvm(pm.as_mut_ptr()) };

        assert_eq!(&pm[10..14], &[1, 2, 3, 4]);
        assert!(pm[..10].iter().all(|&b| b == 0xEE));
        assert!(pm[14..].iter().all(|&b| b == 0xEE));
    }
}
