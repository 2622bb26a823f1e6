//! # Heap Operations
//!
//! The MVCC write and read paths. Every operation follows the same
//! discipline:
//!
//! 1. A doomed transaction short-circuits with `WAIT_ABORT`.
//! 2. Writers append their undo record *before* mutating the tuple, so a
//!    crash at any point rolls forward to a consistent state.
//! 3. Tuple mutation happens under the row entry's lock; the new header
//!    links to the pre-image through `prev` and carries the writer's
//!    TxSlot pointer in `tx_info`.
//! 4. Readers take no version they cannot prove visible: an invisible,
//!    in-progress or aborted head version sends them down the `prev`
//!    chain, reconstructing older versions from undo records in DRAM.
//!
//! Writers never wait on each other. A write-write conflict dooms the
//! caller (`WAIT_ABORT` latch) and surfaces as `UPDATE_CONFLICT`; retry
//! policy belongs to the caller.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::config::constants::{INVALID_ROW_ID, INVALID_UNDO_PTR, TUPLE_HEADER_SIZE};
use crate::db::Table;
use crate::heap::force_write_back_csn;
use crate::heap::tuple::{RamTuple, RowId, TupleHeader};
use crate::heap::HeapStatus;
use crate::pmem;
use crate::txn::{TmResult, Transaction};
use crate::undo::record::UndoRecord;

/// Exclusive upper bound over the rowids this table may have handed out.
pub fn heap_upper_row_id(table: &Table) -> Result<RowId> {
    table.map().upper_row_id()
}

fn read_pm_bytes(addr: *const u8, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    // SAFETY: callers pass addresses inside a mapped tuple slot of at
    // least `len` bytes.
    unsafe { std::ptr::copy_nonoverlapping(addr, bytes.as_mut_ptr(), len) };
    bytes
}

/// Insert `tuple` into the table, returning its new rowid
/// (`INVALID_ROW_ID` when the transaction is doomed).
pub fn heap_insert(tx: &mut Transaction, table: &Table, tuple: &mut RamTuple) -> Result<RowId> {
    ensure!(
        table.row_len() == tuple.row_len(),
        "tuple length {} does not match table row length {}",
        tuple.row_len(),
        table.row_len()
    );
    if tx.is_doomed() {
        return Ok(INVALID_ROW_ID);
    }
    tx.prepare_undo()?;

    let map = table.map();
    let reserved = tx
        .db()
        .with_table_cache(table.seg_head(), |cache| {
            map.get_next_empty_row(tx.tx_info(), cache)
        })??;
    let Some((row_id, nvm_addr)) = reserved else {
        bail!("table {} exhausted its rowid space", table.seg_head());
    };

    let record = UndoRecord::insert(tx.tsp(), table.seg_head(), row_id, table.row_len());
    tx.append_undo(&record)?;

    tuple.init_head(tx.tx_info(), INVALID_UNDO_PTR, true, false);
    // SAFETY: nvm_addr is the reserved slot, exclusively ours until the
    // header's is_used flag goes durable.
    unsafe { tuple.serialize(nvm_addr) };

    if force_write_back_csn() {
        map.get_entry(row_id, false)?;
        tx.push_write_set(map.clone(), row_id);
    }
    Ok(row_id)
}

/// Insert an all-zero row and hand back its DRAM tuple for the caller to
/// fill via the update path.
pub fn heap_insert_empty(tx: &mut Transaction, table: &Table) -> Result<(RamTuple, RowId)> {
    let mut tuple = RamTuple::new(table.row_len());
    let row_id = heap_insert(tx, table, &mut tuple)?;
    Ok((tuple, row_id))
}

/// Read the newest version of `row_id` visible to `tx` into `tuple`.
pub fn heap_read(
    tx: &Transaction,
    table: &Table,
    row_id: RowId,
    tuple: &mut RamTuple,
) -> Result<HeapStatus> {
    ensure!(
        table.row_len() == tuple.row_len(),
        "tuple length {} does not match table row length {}",
        tuple.row_len(),
        table.row_len()
    );
    if tx.is_doomed() {
        return Ok(HeapStatus::WaitAbort);
    }

    let map = table.map();
    let Some(entry) = map.get_entry(row_id, true)? else {
        return Ok(HeapStatus::ReadRowNotUsed);
    };

    {
        let mut cache = entry.lock();
        let src = entry.load_cache(&mut cache, map.mgr().tuple_len() as usize);
        // SAFETY: src is either the PM slot or a shadow of at least the
        // slot width.
        unsafe { tuple.deserialize(src) };
        entry.add_read_ref();
    }

    if !tuple.is_used() {
        return Ok(HeapStatus::ReadRowNotUsed);
    }

    loop {
        match tx.version_is_visible(tuple.header.tx_info) {
            TmResult::Ok | TmResult::SelfUpdated => {
                return Ok(if tuple.is_deleted() {
                    HeapStatus::RowDeleted
                } else {
                    HeapStatus::Ok
                });
            }
            TmResult::Invisible | TmResult::Aborted | TmResult::BeingModified => {
                if !tuple.has_prev_version() {
                    return Ok(HeapStatus::NoVisibleVersion);
                }
                let record = tx.db().undo_set().read_record(tuple.header.prev)?;
                record.apply_to_tuple(tuple)?;
                if !tuple.is_used() {
                    // Walked past the row's insert.
                    return Ok(HeapStatus::NoVisibleVersion);
                }
            }
        }
    }
}

enum WriteCheck {
    Proceed(crate::heap::tuple::HeaderSnapshot),
    Done(HeapStatus),
}

/// Shared head of update/delete: conflict-check the current header under
/// the entry lock, dooming the transaction on conflict.
fn check_writable(
    tx: &mut Transaction,
    entry: &crate::heap::rowid_map::RowIdMapEntry,
) -> WriteCheck {
    let header = entry.header().snapshot();
    match tx.satisfied_update(header.tx_info) {
        TmResult::Ok | TmResult::SelfUpdated => {}
        TmResult::Invisible | TmResult::BeingModified | TmResult::Aborted => {
            tx.wait_abort();
            return WriteCheck::Done(HeapStatus::UpdateConflict);
        }
    }
    if header.is_deleted {
        // A visible tombstone: updating a deleted row is an error, and it
        // dooms the transaction like any other write conflict.
        tx.wait_abort();
        return WriteCheck::Done(HeapStatus::RowDeleted);
    }
    WriteCheck::Proceed(header)
}

fn capture_old_ranges(
    tuple: &RamTuple,
    data_addr: *const u8,
) -> SmallVec<[(u32, Vec<u8>); 8]> {
    if tuple.patches().is_empty() {
        // No tracked columns: capture the whole row so rollback restores
        // everything a full serialize may overwrite.
        let mut ranges = SmallVec::new();
        ranges.push((0u32, read_pm_bytes(data_addr, tuple.row_len() as usize)));
        return ranges;
    }
    tuple
        .patches()
        .iter()
        .map(|patch| {
            // SAFETY: patches are bounded by the row length.
            let old = read_pm_bytes(
                unsafe { data_addr.add(patch.offset as usize) },
                patch.len as usize,
            );
            (patch.offset, old)
        })
        .collect()
}

/// Read-modify-write update: the caller read the row into `tuple`,
/// changed it, and the whole row image is serialized back.
pub fn heap_update(
    tx: &mut Transaction,
    table: &Table,
    row_id: RowId,
    tuple: &mut RamTuple,
) -> Result<HeapStatus> {
    heap_update_impl(tx, table, row_id, tuple, false)
}

/// Delta update: only the tuple's tracked ranges are copied to PM.
pub fn heap_update_delta(
    tx: &mut Transaction,
    table: &Table,
    row_id: RowId,
    tuple: &mut RamTuple,
) -> Result<HeapStatus> {
    heap_update_impl(tx, table, row_id, tuple, true)
}

fn heap_update_impl(
    tx: &mut Transaction,
    table: &Table,
    row_id: RowId,
    tuple: &mut RamTuple,
    delta_only: bool,
) -> Result<HeapStatus> {
    ensure!(
        table.row_len() == tuple.row_len(),
        "tuple length {} does not match table row length {}",
        tuple.row_len(),
        table.row_len()
    );
    if tx.is_doomed() {
        return Ok(HeapStatus::WaitAbort);
    }
    tx.prepare_undo()?;

    let map = table.map();
    let Some(entry) = map.get_entry(row_id, false)? else {
        return Ok(HeapStatus::ReadRowNotUsed);
    };

    let mut cache = entry.lock();
    let old_header = match check_writable(tx, entry) {
        WriteCheck::Proceed(header) => header,
        WriteCheck::Done(status) => return Ok(status),
    };

    // SAFETY: entry addresses a mapped slot; the payload starts after the
    // header.
    let data_addr = unsafe { entry.nvm_addr().add(TUPLE_HEADER_SIZE) };
    let old_ranges = capture_old_ranges(tuple, data_addr);
    let range_refs: SmallVec<[(u32, &[u8]); 8]> = old_ranges
        .iter()
        .map(|(offset, bytes)| (*offset, bytes.as_slice()))
        .collect();
    let record = UndoRecord::update(
        tx.tsp(),
        table.seg_head(),
        row_id,
        &old_header,
        &range_refs,
    );
    let undo_ptr = tx.append_undo(&record)?;

    tuple.init_head(
        tx.tx_info(),
        undo_ptr,
        old_header.is_used,
        old_header.is_deleted,
    );

    let slot_len = map.mgr().tuple_len() as usize;
    if delta_only {
        let tx_info = tx.tx_info();
        entry.write_through(&mut cache, slot_len, |addr| {
            // SAFETY: addr is a slot-width buffer (PM or shadow).
            unsafe {
                let header = TupleHeader::from_addr(addr);
                header.set_prev(undo_ptr);
                header.set_tx_info(tx_info);
                header.flush();
                tuple.copy_patches_to_nvm(addr.add(TUPLE_HEADER_SIZE));
            }
        });
    } else {
        entry.write_through(&mut cache, slot_len, |addr| {
            // SAFETY: addr is a slot-width buffer (PM or shadow).
            unsafe { tuple.serialize(addr) };
        });
    }
    entry.add_write_ref();
    drop(cache);

    tuple.clear_patches();
    tx.push_write_set(map.clone(), row_id);
    Ok(HeapStatus::Ok)
}

/// Delete `row_id`: append the full pre-image, then flip the header to a
/// tombstone (header-only flush; the body is untouched).
pub fn heap_delete(tx: &mut Transaction, table: &Table, row_id: RowId) -> Result<HeapStatus> {
    if tx.is_doomed() {
        return Ok(HeapStatus::WaitAbort);
    }
    tx.prepare_undo()?;

    let map = table.map();
    let Some(entry) = map.get_entry(row_id, false)? else {
        return Ok(HeapStatus::ReadRowNotUsed);
    };

    let mut cache = entry.lock();
    let old_header = match check_writable(tx, entry) {
        WriteCheck::Proceed(header) => header,
        WriteCheck::Done(status) => return Ok(status),
    };

    // SAFETY: payload of a mapped slot.
    let data_addr = unsafe { entry.nvm_addr().add(TUPLE_HEADER_SIZE) };
    let old_body = read_pm_bytes(data_addr, table.row_len() as usize);
    let record = UndoRecord::delete(tx.tsp(), table.seg_head(), row_id, &old_header, &old_body);
    let undo_ptr = tx.append_undo(&record)?;

    let tx_info = tx.tx_info();
    entry.write_through(&mut cache, TUPLE_HEADER_SIZE, |addr| {
        // SAFETY: addr holds at least a tuple header.
        unsafe {
            let header = TupleHeader::from_addr(addr);
            header.set_deleted(true);
            header.set_prev(undo_ptr);
            header.set_tx_info(tx_info);
            header.flush();
        }
        pmem::sfence();
    });
    entry.clear_refs();
    drop(cache);

    tx.push_write_set(map.clone(), row_id);
    Ok(HeapStatus::Ok)
}
