//! # Transactions, CSNs and Visibility
//!
//! ## The CSN Space
//!
//! Commit sequence numbers are allocated from one process-wide atomic
//! counter. Every CSN has its top bit set (`MIN_TX_CSN = 1 << 63`), which
//! is the whole discriminator story for a tuple's `tx_info`: MSB 1 means
//! "committed at this CSN", MSB 0 means "points at the writer's TxSlot".
//! Across restarts the counter is floored by a run watermark
//! (`MIN_TX_CSN + (run << 32)`) and by the largest committed CSN found in
//! the undo segments, so CSNs never repeat.
//!
//! ## Snapshots
//!
//! A transaction's snapshot is the global CSN at `begin`. The process
//! array tracks every active snapshot in a fixed slot array; the
//! reclaimer's global minimum is the smallest registered snapshot (or the
//! current CSN when none is active). Versions at or below every live
//! snapshot are unreachable and may be recycled.
//!
//! ## Visibility (snapshot isolation)
//!
//! ```text
//! tx_info is CSN:   visible iff csn <= snapshot
//! tx_info is TSP:   self             -> SELF_UPDATED
//!                   slot recycled    -> visible (csn <= min snapshot)
//!                   COMMITTED        -> visible iff slot.csn <= snapshot
//!                   IN_PROGRESS      -> BEING_MODIFIED
//!                   ROLL_BACKED      -> ABORTED
//! ```
//!
//! Writers never block each other: a write that hits an in-progress or
//! invisible version dooms its own transaction (`WAIT_ABORT`) and returns
//! a conflict, so no deadlock cycle can form.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::constants::{MAX_THREADS, MIN_TX_CSN};
use crate::db::DbInner;
use crate::heap::force_write_back_csn;
use crate::heap::rowid_map::RowIdMap;
use crate::heap::tuple::RowId;
use crate::pmem;
use crate::undo::record::{UndoRecPtr, UndoRecord};
use crate::undo::{make_tsp, rollback_slot, TxSlotView};
use crate::undo::segment::TxSlotStatus;

/// Visibility verdict for one tuple version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmResult {
    Ok,
    SelfUpdated,
    Invisible,
    BeingModified,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    InProgress,
    WaitAbort,
    Committed,
    RollBacked,
}

/// Process-wide transaction bookkeeping: the CSN counter and the active
/// snapshot of every running transaction.
pub struct ProcessArray {
    global_csn: AtomicU64,
    snapshots: Vec<AtomicU64>,
    slot_lock: Mutex<()>,
}

impl ProcessArray {
    pub fn new(base_csn: u64) -> Self {
        debug_assert!(base_csn >= MIN_TX_CSN);
        Self {
            global_csn: AtomicU64::new(base_csn),
            snapshots: (0..MAX_THREADS).map(|_| AtomicU64::new(0)).collect(),
            slot_lock: Mutex::new(()),
        }
    }

    pub fn current_csn(&self) -> u64 {
        self.global_csn.load(Ordering::SeqCst)
    }

    fn next_csn(&self) -> u64 {
        self.global_csn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim a snapshot slot and register the current CSN as snapshot.
    fn begin_snapshot(&self) -> Result<(usize, u64)> {
        let _guard = self.slot_lock.lock();
        let snapshot = self.current_csn();
        for (idx, slot) in self.snapshots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == 0 {
                slot.store(snapshot, Ordering::SeqCst);
                return Ok((idx, snapshot));
            }
        }
        bail!("too many concurrent transactions (max {})", MAX_THREADS)
    }

    fn end_snapshot(&self, slot: usize) {
        self.snapshots[slot].store(0, Ordering::SeqCst);
    }

    /// Minimum over the current CSN and every active snapshot. Everything
    /// at or below it is reachable by no one.
    pub fn global_min_snapshot(&self) -> u64 {
        let mut min = self.current_csn();
        for slot in &self.snapshots {
            let snapshot = slot.load(Ordering::Relaxed);
            if snapshot != 0 && snapshot < min {
                min = snapshot;
            }
        }
        min
    }
}

/// One transaction against the store. Obtained from [`Db::begin`]; must be
/// finished with [`commit`] or [`abort`]. Dropping an unfinished
/// transaction aborts it.
///
/// [`Db::begin`]: crate::db::Db::begin
/// [`commit`]: Transaction::commit
/// [`abort`]: Transaction::abort
pub struct Transaction<'a> {
    db: &'a DbInner,
    proc_slot: usize,
    snapshot: u64,
    status: TxStatus,
    tsp: Option<u32>,
    undo_seg_idx: usize,
    slot_id: u64,
    write_set: SmallVec<[(Arc<RowIdMap>, RowId); 16]>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(db: &'a DbInner) -> Result<Self> {
        let (proc_slot, snapshot) = db.proc_array().begin_snapshot()?;
        Ok(Self {
            db,
            proc_slot,
            snapshot,
            status: TxStatus::InProgress,
            tsp: None,
            undo_seg_idx: 0,
            slot_id: 0,
            write_set: SmallVec::new(),
            finished: false,
        })
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn is_doomed(&self) -> bool {
        self.status == TxStatus::WaitAbort
    }

    /// Latch the transaction doomed; every further heap operation fails
    /// with `WAIT_ABORT` until the caller aborts.
    pub fn wait_abort(&mut self) {
        if self.status == TxStatus::InProgress {
            self.status = TxStatus::WaitAbort;
        }
    }

    pub(crate) fn db(&self) -> &'a DbInner {
        self.db
    }

    /// TxSlot pointer of this transaction's slot; valid after the first
    /// write prepared its undo.
    pub(crate) fn tsp(&self) -> u32 {
        self.tsp.expect("prepare_undo precedes any undo access")
    }

    pub(crate) fn tx_info(&self) -> u64 {
        self.tsp() as u64
    }

    /// Allocate the TxSlot lazily on the first write, attaching this
    /// thread to an undo segment (and switching away from a full one)
    /// as needed.
    pub(crate) fn prepare_undo(&mut self) -> Result<()> {
        if self.tsp.is_some() {
            return Ok(());
        }
        let seg_idx = self.db.acquire_undo_segment()?;
        let segment = self.db.undo_set().segment(seg_idx);
        let slot_id = segment.allocate_tx_slot();
        self.undo_seg_idx = seg_idx;
        self.slot_id = slot_id;
        self.tsp = Some(make_tsp(seg_idx as u32, slot_id));
        Ok(())
    }

    pub(crate) fn append_undo(&self, record: &UndoRecord) -> Result<UndoRecPtr> {
        let segment = self.db.undo_set().segment(self.undo_seg_idx);
        segment.append_record(self.slot_id, record)
    }

    pub(crate) fn push_write_set(&mut self, map: Arc<RowIdMap>, row_id: RowId) {
        self.write_set.push((map, row_id));
    }

    /// Visibility of a version carrying `tx_info`, for reads.
    pub fn version_is_visible(&self, tx_info: u64) -> TmResult {
        if tx_info & MIN_TX_CSN != 0 {
            return if tx_info <= self.snapshot {
                TmResult::Ok
            } else {
                TmResult::Invisible
            };
        }
        let tsp = tx_info as u32;
        if self.tsp == Some(tsp) {
            return TmResult::SelfUpdated;
        }
        match self.db.undo_set().read_tx_slot(tsp) {
            TxSlotView::Recycled => TmResult::Ok,
            TxSlotView::Slot { status, csn } => match status {
                TxSlotStatus::Committed => {
                    if csn <= self.snapshot {
                        TmResult::Ok
                    } else {
                        TmResult::Invisible
                    }
                }
                TxSlotStatus::InProgress => TmResult::BeingModified,
                TxSlotStatus::RollBacked | TxSlotStatus::Empty => TmResult::Aborted,
            },
        }
    }

    /// Write-conflict check against the current header, for updates and
    /// deletes.
    pub fn satisfied_update(&self, tx_info: u64) -> TmResult {
        if tx_info & MIN_TX_CSN != 0 {
            return if tx_info <= self.snapshot {
                TmResult::Ok
            } else {
                TmResult::Invisible
            };
        }
        let tsp = tx_info as u32;
        if self.tsp == Some(tsp) {
            return TmResult::Ok;
        }
        match self.db.undo_set().read_tx_slot(tsp) {
            TxSlotView::Recycled => TmResult::Ok,
            TxSlotView::Slot { status, csn } => match status {
                TxSlotStatus::Committed => {
                    if csn <= self.snapshot {
                        TmResult::Ok
                    } else {
                        TmResult::Invisible
                    }
                }
                TxSlotStatus::InProgress => TmResult::BeingModified,
                // Racing a rollback's restore; conflict rather than
                // trusting the half-restored header.
                TxSlotStatus::RollBacked | TxSlotStatus::Empty => TmResult::Aborted,
            },
        }
    }

    /// Commit: assign the CSN, write it back into every touched header,
    /// then durably mark the TxSlot committed.
    pub fn commit(mut self) -> Result<()> {
        ensure!(
            self.status == TxStatus::InProgress,
            "doomed transaction must abort, not commit"
        );

        if self.tsp.is_none() {
            // Read-only: nothing durable to publish.
            self.db.proc_array().end_snapshot(self.proc_slot);
            self.status = TxStatus::Committed;
            self.finished = true;
            return Ok(());
        }

        let csn = self.db.proc_array().next_csn();
        if force_write_back_csn() {
            for (map, row_id) in &self.write_set {
                let entry = map
                    .get_entry(*row_id, false)?
                    .expect("write-set rows resolved during the operation");
                entry.write_back_csn(csn);
            }
            pmem::sfence();
        }

        let segment = self.db.undo_set().segment(self.undo_seg_idx);
        segment.mark_committed(self.slot_id, csn);

        self.db.proc_array().end_snapshot(self.proc_slot);
        self.status = TxStatus::Committed;
        self.write_set.clear();
        self.finished = true;
        Ok(())
    }

    /// Abort: apply this transaction's undo records in reverse, restoring
    /// every touched tuple, then mark the slot rolled back.
    pub fn abort(mut self) -> Result<()> {
        self.do_abort()
    }

    fn do_abort(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if let Some(_tsp) = self.tsp {
            let segment = self.db.undo_set().segment(self.undo_seg_idx);
            let freed = rollback_slot(self.db, segment, self.slot_id)?;
            self.db.return_freed_rowids(&freed);
        }
        self.db.proc_array().end_snapshot(self.proc_slot);
        self.status = TxStatus::RollBacked;
        self.write_set.clear();
        self.finished = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.do_abort();
        }
    }
}
