//! # Tablespace: Extent Allocation over a LogicFile
//!
//! All tables share one tablespace. Its unit of allocation is the 2 MiB
//! extent; extents are handed out per NUMA directory, so a thread pinned
//! to node `n` receives extents whose containing segment is striped onto
//! directory `n`.
//!
//! ## Space Header (page 0)
//!
//! ```text
//! Offset  Size  Field
//! 0       8     magic
//! 8       4*4   next_extent[dir]   per-directory allocation cursor
//! ```
//!
//! The cursors live on PM and are bumped (and flushed) before the extent
//! is first used, so a crash can leak at most the extent being allocated —
//! it can never hand the same extent to two tables across a restart.
//!
//! ## Extent Addressing
//!
//! For directory `d`, the `k`-th extent of that directory lives in segment
//! `d + dir_count * (k / extents_per_segment)` at extent offset
//! `k % extents_per_segment`. Page 0 (the header) occupies the first
//! extent of segment 0, so directory 0's cursor starts at 1.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{bail, ensure, Result};
use tracing::info;

use crate::config::constants::{EXTENT_SIZE, PAGE_SIZE, TABLESPACE_MAX_SEGMENTS};
use crate::config::DirectoryConfig;
use crate::pmem;
use crate::storage::{LogicFile, PageId};

const SPACE_MAGIC: u64 = u64::from_le_bytes(*b"pmheapts");
const MAX_DIR_CURSORS: usize = crate::config::constants::MAX_NUMA_DIRS;

#[repr(C)]
struct SpaceHeader {
    magic: u64,
    next_extent: [AtomicU32; MAX_DIR_CURSORS],
}

pub struct TableSpace {
    file: LogicFile,
    dir_config: Arc<DirectoryConfig>,
    pages_per_extent: u32,
    extents_per_segment: u32,
}

impl TableSpace {
    /// Format a fresh tablespace: creates segment 0 and writes the space
    /// header.
    pub fn create(dir_config: Arc<DirectoryConfig>, segment_size: usize) -> Result<Self> {
        let space = Self::open_file(dir_config, segment_size)?;
        let base = space.file.segment_base(0)?;
        // SAFETY: segment 0 is freshly created, zeroed, and not yet shared;
        // the magic is written before any header reference is formed.
        unsafe { (base as *mut u64).write(SPACE_MAGIC) };
        let header = space.header()?;
        header.next_extent[0].store(1, Ordering::Relaxed);
        // SAFETY: the header occupies the front of mounted segment 0.
        unsafe { pmem::flush(base, size_of::<SpaceHeader>()) };
        pmem::sfence();
        info!(segment_size, "created tablespace");
        Ok(space)
    }

    /// Attach to an existing tablespace and mount every segment.
    pub fn open(dir_config: Arc<DirectoryConfig>, segment_size: usize) -> Result<Self> {
        let space = Self::open_file(dir_config, segment_size)?;
        space.file.mount_all()?;
        let header = space.header()?;
        ensure!(
            header.magic == SPACE_MAGIC,
            "tablespace header corrupt: magic {:#x}",
            header.magic
        );
        info!(segments = space.file.segment_count(), "mounted tablespace");
        Ok(space)
    }

    fn open_file(dir_config: Arc<DirectoryConfig>, segment_size: usize) -> Result<Self> {
        ensure!(
            segment_size % EXTENT_SIZE == 0,
            "tablespace segment size {} is not a multiple of the extent size",
            segment_size
        );
        let file = LogicFile::new(
            dir_config.clone(),
            "heap",
            segment_size,
            TABLESPACE_MAX_SEGMENTS,
            true,
        )?;
        Ok(Self {
            file,
            dir_config,
            pages_per_extent: (EXTENT_SIZE / PAGE_SIZE) as u32,
            extents_per_segment: (segment_size / EXTENT_SIZE) as u32,
        })
    }

    fn header(&self) -> Result<&SpaceHeader> {
        let base = self.file.segment_base(0)?;
        // SAFETY: segment 0 is mmap'd page-aligned and at least one extent
        // long; SpaceHeader fits in the first cache lines and contains only
        // u64/atomics, all validly readable from zeroed or formatted PM.
        Ok(unsafe { &*(base as *const SpaceHeader) })
    }

    pub fn dir_config(&self) -> &Arc<DirectoryConfig> {
        &self.dir_config
    }

    pub fn dir_count(&self) -> u32 {
        self.dir_config.dir_count() as u32
    }

    pub fn pages_per_extent(&self) -> u32 {
        self.pages_per_extent
    }

    /// Allocate one extent from the directory of `numa_hint`, mounting the
    /// containing segment on demand. Returns the extent's first page id.
    /// Exhausting the segment table is fatal: the store is out of PM space.
    pub fn alloc_extent(&self, numa_hint: usize) -> Result<PageId> {
        let dir_count = self.dir_config.dir_count();
        let dir = numa_hint % dir_count;
        let header = self.header()?;

        let k = header.next_extent[dir].fetch_add(1, Ordering::Relaxed);
        // The cursor must be durable before the extent carries data.
        // SAFETY: cursor lies inside the mounted header.
        unsafe {
            pmem::flush(
                &header.next_extent[dir] as *const AtomicU32 as *const u8,
                size_of::<AtomicU32>(),
            );
        }
        pmem::sfence();

        let segment = dir + dir_count * (k / self.extents_per_segment) as usize;
        if segment >= TABLESPACE_MAX_SEGMENTS {
            bail!("out of PM space: tablespace segment table exhausted");
        }
        let within = k % self.extents_per_segment;
        let global_extent = segment as u64 * self.extents_per_segment as u64 + within as u64;
        let page_id = (global_extent * self.pages_per_extent as u64) as PageId;

        self.file.extend(page_id)?;
        Ok(page_id)
    }

    /// PM address of a page. The page must belong to an allocated extent.
    pub fn page_addr(&self, page_id: PageId) -> Result<*mut u8> {
        self.file.page_base(page_id)
    }

    /// Ensure the segment containing `page_id` is mounted (used when a
    /// reader resolves an extent id installed by another process run).
    pub fn ensure_mounted(&self, page_id: PageId) -> Result<()> {
        self.file.extend(page_id)
    }

    pub fn unmount(&self) {
        self.file.unmount();
    }
}
