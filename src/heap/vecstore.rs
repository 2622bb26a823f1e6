//! # Row Allocation: Bitmaps and Thread Ranges
//!
//! Inserts must never hand the same rowid to two threads. The allocation
//! scheme gives every thread an exclusive range of a whole extent at a
//! time, so the common case touches no shared state at all:
//!
//! 1. Pop a previously freed rowid from the thread-local cache.
//! 2. Advance the thread's current range.
//! 3. When the range drains, atomically claim one bit from the table's
//!    per-directory extent bitmap and take the whole extent as the new
//!    range.
//!
//! A bitmap exists per PM directory; the thread claims from its own NUMA
//! directory's bitmap, and extent `dir + dir_count * local_bit` is exactly
//! an extent whose tablespace segment is striped onto that directory.
//! When the local directory's bitmap is exhausted the claim falls back to
//! remote directories before giving up.
//!
//! After a restart the bitmaps start empty and rowids of past runs are
//! handed out again; the insert loop detects `is_used` slots on PM and
//! abandons the contended range, so reuse is safe (and is also how space
//! freed by deletes comes back).

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::config::constants::{INVALID_ROW_ID, MAX_ROW_ID};
use crate::heap::tuple::RowId;
use crate::numa;

/// Atomic bitmap; one bit per extent of one directory's stripe.
pub struct GlobalBitmap {
    words: Vec<AtomicU64>,
    bits: u32,
}

impl GlobalBitmap {
    pub fn new(bits: u32) -> Self {
        let words = (bits as usize).div_ceil(64);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits,
        }
    }

    /// Claim the lowest clear bit, or None when every bit is taken.
    pub fn acquire(&self) -> Option<u32> {
        for (word_idx, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            loop {
                let free = (!current).trailing_zeros();
                if free >= 64 {
                    break;
                }
                let bit = word_idx as u32 * 64 + free;
                if bit >= self.bits {
                    return None;
                }
                match word.compare_exchange_weak(
                    current,
                    current | (1 << free),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(bit),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }
}

/// Half-open rowid range owned by one thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowIdRange {
    next: u32,
    end: u32,
}

impl RowIdRange {
    pub fn set(&mut self, start: u32, end: u32) {
        self.next = start;
        self.end = end;
    }

    pub fn next(&mut self) -> RowId {
        if self.next >= self.end {
            return INVALID_ROW_ID;
        }
        let rid = self.next;
        self.next += 1;
        rid
    }
}

/// Per-thread, per-table allocation state.
#[derive(Default)]
pub struct TableCache {
    pub rowid_cache: SmallVec<[RowId; 16]>,
    pub range: RowIdRange,
    /// Set once this thread has successfully reserved a row in the table;
    /// before that, an `is_used` collision abandons the whole range.
    pub insert_init: bool,
}

pub struct VecStore {
    tuples_per_extent: u32,
    bitmaps: Vec<GlobalBitmap>,
}

impl VecStore {
    pub fn new(dir_count: usize, tuples_per_extent: u32) -> Self {
        assert!(dir_count > 0);
        let extents_per_dir = MAX_ROW_ID / tuples_per_extent / dir_count as u32;
        let bitmaps = (0..dir_count)
            .map(|_| GlobalBitmap::new(extents_per_dir))
            .collect();
        Self {
            tuples_per_extent,
            bitmaps,
        }
    }

    /// Next reserved rowid for this thread: freed-rowid cache, then the
    /// current range, then a fresh extent. Returns `INVALID_ROW_ID` only
    /// when the table's whole rowid space is exhausted.
    pub fn try_next_rowid(&self, cache: &mut TableCache) -> RowId {
        if let Some(rid) = cache.rowid_cache.pop() {
            return rid;
        }
        loop {
            let rid = cache.range.next();
            if rid != INVALID_ROW_ID {
                return rid;
            }
            if !self.try_next_segment(cache) {
                return INVALID_ROW_ID;
            }
        }
    }

    /// Claim a fresh extent as the thread's range, preferring the local
    /// NUMA directory. Returns false when every directory is exhausted.
    pub fn try_next_segment(&self, cache: &mut TableCache) -> bool {
        let dir_count = self.bitmaps.len();
        let local = numa::current_node() % dir_count;
        for probe in 0..dir_count {
            let dir = (local + probe) % dir_count;
            if let Some(local_bit) = self.bitmaps[dir].acquire() {
                let global = dir as u64 + dir_count as u64 * local_bit as u64;
                let start = global * self.tuples_per_extent as u64;
                let end = (start + self.tuples_per_extent as u64).min(MAX_ROW_ID as u64);
                cache.range.set(start as u32, end as u32);
                return true;
            }
        }
        false
    }
}
