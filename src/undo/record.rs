//! # Undo Records
//!
//! Every mutation appends one undo record before touching the tuple. The
//! record is both the rollback image and the older version a reader
//! reconstructs when it walks a version chain.
//!
//! ## Binary Layout
//!
//! ```text
//! +----------------------------+
//! | UndoRecordHeader (32 B)    |
//! |  - prev: u64               |  prior version's undo pointer
//! |  - tx_slot: u32            |  TSP of the writing transaction
//! |  - seg_head: u32           |  owning table's segment-head page id
//! |  - row_id: u32             |
//! |  - payload_len: u32        |
//! |  - undo_type: u8 (+pad)    |
//! +----------------------------+
//! | payload                    |
//! +----------------------------+
//! ```
//!
//! ## Payload by Type
//!
//! - **Insert**: 4 bytes, the table row length. Rolling an insert back
//!   just clears the slot's `is_used` flag.
//! - **Update**: the 24-byte pre-image of the tuple header followed by a
//!   delta list — `{offset: u32, len: u32, bytes}` per changed range.
//! - **Delete**: the 24-byte header pre-image followed by the full row
//!   body.
//!
//! Records are applied in two directions: onto the PM tuple (rollback and
//! recovery) or onto a DRAM [`RamTuple`] (version-chain walk during a
//! read).

use eyre::{bail, ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::constants::{
    INVALID_UNDO_PTR, TUPLE_HEADER_SIZE, UNDO_PTR_OFFSET_BITS, UNDO_PTR_OFFSET_MASK,
};
use crate::heap::tuple::{HeaderSnapshot, RamTuple, RowId, TupleHeader};
use crate::pmem;

/// Pointer to an undo record: `(undo_segment_id << 48) | byte_offset`.
pub type UndoRecPtr = u64;

pub fn make_undo_ptr(segment_id: u32, offset: u64) -> UndoRecPtr {
    debug_assert!(offset <= UNDO_PTR_OFFSET_MASK);
    ((segment_id as u64) << UNDO_PTR_OFFSET_BITS) | offset
}

pub fn undo_ptr_segment(ptr: UndoRecPtr) -> u32 {
    (ptr >> UNDO_PTR_OFFSET_BITS) as u32
}

pub fn undo_ptr_offset(ptr: UndoRecPtr) -> u64 {
    ptr & UNDO_PTR_OFFSET_MASK
}

pub fn undo_ptr_is_valid(ptr: UndoRecPtr) -> bool {
    ptr != INVALID_UNDO_PTR
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UndoType {
    Insert = 1,
    Update = 2,
    Delete = 3,
}

impl UndoType {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(Self::Insert),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            other => bail!("unknown undo record type {}", other),
        }
    }
}

pub const UNDO_RECORD_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct UndoRecordHeader {
    prev: u64,
    tx_slot: u32,
    seg_head: u32,
    row_id: u32,
    payload_len: u32,
    undo_type: u8,
    _pad: [u8; 7],
}

const _: () = assert!(size_of::<UndoRecordHeader>() == UNDO_RECORD_HEADER_SIZE);

/// One decoded (or to-be-encoded) undo record.
#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub undo_type: UndoType,
    pub tx_slot: u32,
    pub seg_head: u32,
    pub row_id: RowId,
    pub prev: UndoRecPtr,
    pub payload: Vec<u8>,
}

impl UndoRecord {
    pub fn insert(tx_slot: u32, seg_head: u32, row_id: RowId, row_len: u32) -> Self {
        Self {
            undo_type: UndoType::Insert,
            tx_slot,
            seg_head,
            row_id,
            prev: INVALID_UNDO_PTR,
            payload: row_len.to_le_bytes().to_vec(),
        }
    }

    /// Capture the pre-image of an update: the old header plus the old
    /// bytes of every range the new tuple will overwrite.
    pub fn update(
        tx_slot: u32,
        seg_head: u32,
        row_id: RowId,
        old_header: &HeaderSnapshot,
        old_ranges: &[(u32, &[u8])],
    ) -> Self {
        let delta_len: usize = old_ranges.iter().map(|(_, b)| 8 + b.len()).sum();
        let mut payload = Vec::with_capacity(HeaderSnapshot::WIRE_SIZE + delta_len);
        payload.extend_from_slice(&old_header.to_bytes());
        for (offset, bytes) in old_ranges {
            payload.extend_from_slice(&offset.to_le_bytes());
            payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            payload.extend_from_slice(bytes);
        }
        Self {
            undo_type: UndoType::Update,
            tx_slot,
            seg_head,
            row_id,
            prev: old_header.prev,
            payload,
        }
    }

    pub fn delete(
        tx_slot: u32,
        seg_head: u32,
        row_id: RowId,
        old_header: &HeaderSnapshot,
        old_body: &[u8],
    ) -> Self {
        let mut payload = Vec::with_capacity(HeaderSnapshot::WIRE_SIZE + old_body.len());
        payload.extend_from_slice(&old_header.to_bytes());
        payload.extend_from_slice(old_body);
        Self {
            undo_type: UndoType::Delete,
            tx_slot,
            seg_head,
            row_id,
            prev: old_header.prev,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        UNDO_RECORD_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = UndoRecordHeader {
            prev: self.prev,
            tx_slot: self.tx_slot,
            seg_head: self.seg_head,
            row_id: self.row_id,
            payload_len: self.payload.len() as u32,
            undo_type: self.undo_type as u8,
            _pad: [0; 7],
        };
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure!(
            buf.len() >= UNDO_RECORD_HEADER_SIZE,
            "undo record truncated: {} < {}",
            buf.len(),
            UNDO_RECORD_HEADER_SIZE
        );
        // read_from_bytes copies: record buffers come from Vec<u8> reads
        // and carry no alignment guarantee.
        let header = UndoRecordHeader::read_from_bytes(&buf[..UNDO_RECORD_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read undo record header: {e:?}"))?;
        let payload_end = UNDO_RECORD_HEADER_SIZE + header.payload_len as usize;
        ensure!(
            buf.len() >= payload_end,
            "undo record payload truncated: {} < {}",
            buf.len(),
            payload_end
        );
        Ok(Self {
            undo_type: UndoType::from_raw(header.undo_type)?,
            tx_slot: header.tx_slot,
            seg_head: header.seg_head,
            row_id: header.row_id,
            prev: header.prev,
            payload: buf[UNDO_RECORD_HEADER_SIZE..payload_end].to_vec(),
        })
    }

    fn old_header(&self) -> Result<HeaderSnapshot> {
        HeaderSnapshot::from_bytes(&self.payload)
    }

    /// Row length of the table this record belongs to, recoverable from
    /// any record type (recovery opens row maps from this).
    pub fn row_len(&self) -> Result<u32> {
        match self.undo_type {
            UndoType::Insert => {
                ensure!(self.payload.len() >= 4, "insert undo payload truncated");
                Ok(u32::from_le_bytes(self.payload[..4].try_into().unwrap()))
            }
            UndoType::Update | UndoType::Delete => Ok(self.old_header()?.data_size),
        }
    }

    fn for_each_delta(&self, mut f: impl FnMut(u32, &[u8]) -> Result<()>) -> Result<()> {
        let mut cursor = HeaderSnapshot::WIRE_SIZE;
        while cursor < self.payload.len() {
            ensure!(
                cursor + 8 <= self.payload.len(),
                "undo delta header truncated at {}",
                cursor
            );
            let offset =
                u32::from_le_bytes(self.payload[cursor..cursor + 4].try_into().unwrap());
            let len =
                u32::from_le_bytes(self.payload[cursor + 4..cursor + 8].try_into().unwrap());
            let start = cursor + 8;
            let end = start + len as usize;
            ensure!(end <= self.payload.len(), "undo delta bytes truncated at {}", cursor);
            f(offset, &self.payload[start..end])?;
            cursor = end;
        }
        Ok(())
    }

    /// Rewind a DRAM tuple by one version (version-chain walk).
    pub fn apply_to_tuple(&self, tuple: &mut RamTuple) -> Result<()> {
        match self.undo_type {
            UndoType::Insert => {
                // The row did not exist before this insert.
                tuple.header = HeaderSnapshot::empty();
            }
            UndoType::Update => {
                tuple.header = self.old_header()?;
                self.for_each_delta(|offset, bytes| {
                    tuple.restore_range(offset, bytes);
                    Ok(())
                })?;
            }
            UndoType::Delete => {
                tuple.header = self.old_header()?;
                let body = &self.payload[HeaderSnapshot::WIRE_SIZE..];
                ensure!(
                    body.len() == tuple.row_len() as usize,
                    "delete undo body length {} does not match row length {}",
                    body.len(),
                    tuple.row_len()
                );
                tuple.restore_range(0, body);
            }
        }
        Ok(())
    }

    /// Restore the PM tuple at `addr` to its pre-record state (rollback
    /// and crash recovery). Durable on return.
    ///
    /// # Safety
    ///
    /// `addr` must point at the mapped tuple slot this record was captured
    /// from.
    pub unsafe fn apply_to_pm(&self, addr: *mut u8) -> Result<()> {
        let header = TupleHeader::from_addr(addr);
        match self.undo_type {
            UndoType::Insert => {
                header.set_used(false);
                header.set_prev(INVALID_UNDO_PTR);
                header.set_tx_info(0);
                header.flush();
            }
            UndoType::Update => {
                let data = addr.add(TUPLE_HEADER_SIZE);
                self.for_each_delta(|offset, bytes| {
                    let dst = data.add(offset as usize);
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                    pmem::flush(dst, bytes.len());
                    Ok(())
                })?;
                header.store(&self.old_header()?);
                header.flush();
            }
            UndoType::Delete => {
                let old = self.old_header()?;
                let body = &self.payload[HeaderSnapshot::WIRE_SIZE..];
                let data = addr.add(TUPLE_HEADER_SIZE);
                std::ptr::copy_nonoverlapping(body.as_ptr(), data, body.len());
                pmem::flush(data, body.len());
                header.store(&old);
                header.flush();
            }
        }
        pmem::sfence();
        Ok(())
    }
}
