//! # Persistent-Memory Copy Primitives
//!
//! Byte-addressable PM is written with plain stores; durability requires
//! flushing the touched cache lines and fencing afterwards. This module
//! provides the three primitives the rest of the engine builds on:
//!
//! - [`write_to_nvm`]: copy + flush destination lines + store fence.
//!   After it returns the bytes are durable.
//! - [`copy_no_flush`]: copy + store fence, no flush. Used for the second
//!   half of a write that straddles two segments: the caller owns the
//!   flush before relying on durability.
//! - [`flush`] / [`sfence`]: the building blocks, exposed for callers that
//!   batch several small header stores under one fence.
//!
//! ## Ordering Contract
//!
//! ```text
//! write_to_nvm:   stores ─ clflushopt* ─ sfence      durable on return
//! copy_no_flush:  stores ─ sfence                    ordered, NOT durable
//! flush(a, n):    clflushopt per 64-byte line        needs a later sfence
//! ```
//!
//! ## Portability
//!
//! The destination is never assumed aligned: one unaligned copy path is
//! used universally. On x86-64, `clflushopt` is used when the CPU reports
//! it and `clflush` otherwise (detected once). On other architectures the
//! flush degrades to a compiler fence and `sfence` to a release fence —
//! suitable for DRAM-backed development and tests, where mmap'd files have
//! no finer durability point anyway.

use std::sync::atomic::{fence, Ordering};

use crate::config::constants::CACHE_LINE_SIZE;

#[cfg(target_arch = "x86_64")]
mod arch {
    use std::sync::atomic::{AtomicU8, Ordering};

    const FLUSH_UNKNOWN: u8 = 0;
    const FLUSH_CLFLUSHOPT: u8 = 1;
    const FLUSH_CLFLUSH: u8 = 2;

    static FLUSH_KIND: AtomicU8 = AtomicU8::new(FLUSH_UNKNOWN);

    // `core::arch::x86_64` does not expose a `clflushopt` intrinsic (and the
    // `target_feature` attribute rejects the name) on this toolchain, so the
    // instruction is emitted directly via inline asm instead.
    unsafe fn clflushopt(addr: *const u8) {
        std::arch::asm!("clflushopt [{0}]", in(reg) addr, options(nostack, preserves_flags));
    }

    fn clflushopt_supported() -> bool {
        // CPUID leaf 7, sub-leaf 0, EBX bit 23 reports CLFLUSHOPT support.
        let result = core::arch::x86_64::__cpuid(7);
        (result.ebx >> 23) & 1 != 0
    }

    fn flush_kind() -> u8 {
        let kind = FLUSH_KIND.load(Ordering::Relaxed);
        if kind != FLUSH_UNKNOWN {
            return kind;
        }
        let detected = if clflushopt_supported() {
            FLUSH_CLFLUSHOPT
        } else {
            FLUSH_CLFLUSH
        };
        FLUSH_KIND.store(detected, Ordering::Relaxed);
        detected
    }

    /// SAFETY: caller guarantees `addr` lies within a mapped region. Both
    /// flush instructions only write back a cache line; they do not fault
    /// on any mapped address regardless of alignment.
    pub unsafe fn flush_line(addr: *const u8) {
        if flush_kind() == FLUSH_CLFLUSHOPT {
            clflushopt(addr);
        } else {
            core::arch::x86_64::_mm_clflush(addr as _);
        }
    }

    pub fn store_fence() {
        // SAFETY: sfence has no memory-safety preconditions.
        unsafe { core::arch::x86_64::_mm_sfence() };
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod arch {
    use std::sync::atomic::{compiler_fence, fence, Ordering};

    pub unsafe fn flush_line(_addr: *const u8) {
        compiler_fence(Ordering::SeqCst);
    }

    pub fn store_fence() {
        fence(Ordering::Release);
    }
}

/// Issue a store fence: all prior stores (and flushes) complete before any
/// later store is observed.
#[inline]
pub fn sfence() {
    arch::store_fence();
}

/// Flush every cache line covering `[addr, addr + len)`.
///
/// A later [`sfence`] is required before the bytes may be considered
/// durable.
///
/// # Safety
///
/// `addr..addr + len` must lie within a mapped region.
#[inline]
pub unsafe fn flush(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let start = addr as usize & !(CACHE_LINE_SIZE - 1);
    let end = addr as usize + len;
    let mut line = start;
    while line < end {
        arch::flush_line(line as *const u8);
        line += CACHE_LINE_SIZE;
    }
}

/// Copy `src` to PM at `dst`, flush the destination lines and fence.
/// Durable on return.
///
/// # Safety
///
/// `dst` must be valid for `src.len()` writes and must not overlap `src`.
pub unsafe fn write_to_nvm(dst: *mut u8, src: &[u8]) {
    std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
    flush(dst, src.len());
    sfence();
}

/// Copy `src` to PM at `dst` without flushing. Stores are ordered by the
/// trailing fence but the caller must [`flush`] (or rely on a prior
/// [`write_to_nvm`] covering the lines) before counting on durability.
///
/// # Safety
///
/// `dst` must be valid for `src.len()` writes and must not overlap `src`.
pub unsafe fn copy_no_flush(dst: *mut u8, src: &[u8]) {
    std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
    fence(Ordering::Release);
}
