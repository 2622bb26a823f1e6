//! # Heap Layer
//!
//! Row storage proper: the PM tuple format, the DRAM row directory, rowid
//! allocation, and the MVCC heap operations the transaction layer drives.
//!
//! Outcome of a heap operation is a [`HeapStatus`], not an error — errors
//! are reserved for fatal conditions (unmappable PM, exhausted space).

pub mod access;
pub mod rowid_map;
pub mod rowid_mgr;
pub mod tuple;
pub mod vecstore;

use std::sync::atomic::{AtomicBool, Ordering};

/// Non-fatal outcome of a heap operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapStatus {
    Ok,
    /// The row has never been written.
    ReadRowNotUsed,
    /// The visible version is a delete tombstone.
    RowDeleted,
    /// No version of the row is visible to this snapshot.
    NoVisibleVersion,
    /// Another transaction holds an in-progress or later-committed write.
    UpdateConflict,
    /// The transaction is doomed; the caller must abort it.
    WaitAbort,
}

static FORCE_WRITE_BACK_CSN: AtomicBool = AtomicBool::new(true);

/// In force mode (the default) commit rewrites the CSN into every touched
/// tuple header; otherwise headers keep their TxSlot pointer and readers
/// resolve commit state through the slot.
pub fn force_write_back_csn() -> bool {
    FORCE_WRITE_BACK_CSN.load(Ordering::Relaxed)
}

pub fn set_force_write_back_csn(flag: bool) {
    FORCE_WRITE_BACK_CSN.store(flag, Ordering::Release);
}
