//! # Background Recovery and Reclamation
//!
//! One background thread serves both roles. After a bootstrap it first
//! rolls back every transaction that was in progress at the crash, then
//! settles into the reclaimer loop:
//!
//! ```text
//! loop:
//!   sleep ~1ms
//!   min = min(global CSN, every active snapshot)
//!   if min unchanged: continue
//!   for each undo segment:
//!     skip unless free and full
//!     recycle_tx_slot(min)
//! ```
//!
//! Only detached segments are recycled; a thread that fills its own
//! segment detaches from it (switching to an empty one), which is what
//! hands it to the reclaimer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::db::DbInner;
use crate::undo::rollback_slot;
use crate::undo::segment::TxSlotStatus;

/// Roll back every in-progress slot left behind by the previous run.
pub(crate) fn run_recovery(db: &DbInner) {
    let undo = db.undo_set();
    let mut rolled_back = 0usize;
    for idx in 0..undo.count() {
        let segment = undo.segment(idx);
        let Some((start, end)) = segment.recovery_window() else {
            continue;
        };
        for slot_id in start..=end {
            let slot = segment.slot(slot_id);
            if slot.status() == TxSlotStatus::InProgress {
                match rollback_slot(db, segment, slot_id) {
                    Ok(_) => rolled_back += 1,
                    Err(err) => {
                        warn!(segment = idx, slot_id, %err, "undo rollback failed")
                    }
                }
            }
        }
        segment.clear_recovery_window();
    }
    info!(rolled_back, "undo recovery complete");
}

/// Reclaimer loop; returns when the store shuts down.
pub(crate) fn run_reclaimer(db: &DbInner) {
    let mut previous_min = 0u64;
    while !db.stop_requested() {
        std::thread::sleep(Duration::from_millis(1));
        let min_snapshot = db.proc_array().global_min_snapshot();
        if min_snapshot == previous_min {
            continue;
        }
        previous_min = min_snapshot;

        let undo = db.undo_set();
        for idx in 0..undo.count() {
            let segment = undo.segment(idx);
            if !segment.is_full() {
                continue;
            }
            if !undo.is_attachable_for_recycle(idx) {
                continue;
            }
            if let Err(err) = segment.recycle_tx_slot(min_snapshot) {
                warn!(segment = idx, %err, "undo recycle failed");
            }
        }
    }
}

/// Entry point of the background thread spawned at init/bootstrap:
/// recovery first (when pending), then reclamation until shutdown.
pub(crate) fn background_main(db: Arc<DbInner>) {
    run_recovery(&db);
    db.mark_recovered();
    run_reclaimer(&db);
}
