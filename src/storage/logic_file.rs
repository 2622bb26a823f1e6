//! # Segmented Logical PM File
//!
//! A `LogicFile` presents one contiguous page-id address space backed by
//! many fixed-size files, each memory-mapped in full:
//!
//! ```text
//! page id:      0 ........ pps-1 | pps ...... 2*pps-1 | ...
//!               ┌────────────────┐┌────────────────────┐
//! segment:      │ <dir0>/name.0  ││  <dir1>/name.1     │ ...
//!               └────────────────┘└────────────────────┘
//! ```
//!
//! Segment `i` lives in PM directory `i % dir_count`, which is what stripes
//! a space across NUMA nodes. Both the heap tablespace and each undo
//! segment are LogicFiles; they differ only in segment size and naming.
//!
//! ## Address Stability
//!
//! The segment table is pre-reserved to `max_segments` and only ever grows.
//! An address returned by `page_base` stays valid until [`unmount`]:
//! mounting appends, and [`punch`] moves a mapping to a fresh trailing
//! index instead of dropping it. Concurrent readers either see "not yet
//! mounted" (a caller contract violation, fatal) or a stable address.
//!
//! ## Punch
//!
//! Freed segments are renamed to the next unused index, deferring physical
//! reuse: the stale bytes remain on PM and are overwritten when the space
//! wraps around to that index. Segment 0 (always a header) is never
//! punched.
//!
//! [`unmount`]: LogicFile::unmount
//! [`punch`]: LogicFile::punch

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::constants::PAGE_SIZE;
use crate::config::DirectoryConfig;
use crate::pmem;
use crate::storage::PageId;

struct SegmentMap {
    raw: MmapRaw,
    path: PathBuf,
}

pub struct LogicFile {
    dir_config: Arc<DirectoryConfig>,
    space_name: String,
    segment_size: usize,
    pages_per_segment: u32,
    max_segments: usize,
    segments: RwLock<Vec<Option<SegmentMap>>>,
}

impl LogicFile {
    /// Open a logic file and mount segment 0, creating it if `create` is
    /// set. Construction fails if the lowest segment cannot be mapped.
    pub fn new(
        dir_config: Arc<DirectoryConfig>,
        space_name: impl Into<String>,
        segment_size: usize,
        max_segments: usize,
        create: bool,
    ) -> Result<Self> {
        ensure!(segment_size > 0, "segment size must be non-zero");
        let file = Self {
            dir_config,
            space_name: space_name.into(),
            segment_size,
            pages_per_segment: (segment_size / PAGE_SIZE) as u32,
            max_segments,
            segments: RwLock::new(Vec::with_capacity(max_segments)),
        };
        ensure!(
            file.mount_segment(0, create)?,
            "cannot mount segment 0 of space '{}'",
            file.space_name
        );
        Ok(file)
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn pages_per_segment(&self) -> u32 {
        self.pages_per_segment
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().iter().filter(|s| s.is_some()).count()
    }

    /// Highest mounted segment index + 1 (punch targets land past this).
    pub fn segment_table_len(&self) -> usize {
        self.segments.read().len()
    }

    fn segment_filename(&self, segment_id: usize) -> PathBuf {
        self.dir_config
            .dir_by_index(segment_id)
            .join(format!("{}.{}", self.space_name, segment_id))
    }

    /// Map the file backing `segment_id`. Returns false when the file does
    /// not exist and `create` was not requested.
    pub fn mount_segment(&self, segment_id: usize, create: bool) -> Result<bool> {
        ensure!(
            segment_id < self.max_segments,
            "segment {} exceeds capacity {} of space '{}'",
            segment_id,
            self.max_segments,
            self.space_name
        );

        {
            let segments = self.segments.read();
            if segments.get(segment_id).is_some_and(|s| s.is_some()) {
                return Ok(true);
            }
        }

        let path = self.segment_filename(segment_id);
        if !create && !path.exists() {
            return Ok(false);
        }

        let mut segments = self.segments.write();
        if segments.get(segment_id).is_some_and(|s| s.is_some()) {
            return Ok(true);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .wrap_err_with(|| format!("failed to open PM segment '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        if len == 0 {
            file.set_len(self.segment_size as u64).wrap_err_with(|| {
                format!("failed to size '{}' to {} bytes", path.display(), self.segment_size)
            })?;
        } else {
            ensure!(
                len == self.segment_size as u64,
                "PM segment '{}' is {} bytes, expected {}",
                path.display(),
                len,
                self.segment_size
            );
        }

        // SAFETY: map_raw is unsafe-free but the addresses it yields are
        // dereferenced raw elsewhere. That is sound because:
        // 1. The file is sized to segment_size before mapping, so every
        //    address in [base, base + segment_size) is backed.
        // 2. The mapping lives in the segment table until unmount; punch
        //    moves it to another index without dropping it.
        // 3. Store files are private to the process (single-opener layout).
        let raw = MmapOptions::new()
            .map_raw(&file)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        if segments.len() <= segment_id {
            segments.resize_with(segment_id + 1, || None);
        }
        segments[segment_id] = Some(SegmentMap { raw, path });
        Ok(true)
    }

    /// Mount every existing segment after 0. Punch leaves holes in the
    /// index space, so the scan must not stop at the first missing file —
    /// a live segment past a hole would otherwise be shadowed by a fresh
    /// empty file on its next lazy mount.
    pub fn mount_all(&self) -> Result<()> {
        for segment_id in 1..self.max_segments {
            self.mount_segment(segment_id, false)?;
        }
        Ok(())
    }

    /// Ensure the segment containing `page_id` is mounted, creating its
    /// file if necessary.
    pub fn extend(&self, page_id: PageId) -> Result<()> {
        let segment_id = (page_id / self.pages_per_segment) as usize;
        ensure!(
            self.mount_segment(segment_id, true)?,
            "cannot extend space '{}' to segment {}",
            self.space_name,
            segment_id
        );
        Ok(())
    }

    /// PM address of `page_id`. The containing segment must already be
    /// mounted; anything else is a caller contract violation.
    pub fn page_base(&self, page_id: PageId) -> Result<*mut u8> {
        ensure!(self.pages_per_segment > 0, "space '{}' is not paged", self.space_name);
        let segment_id = (page_id / self.pages_per_segment) as usize;
        let offset = (page_id % self.pages_per_segment) as usize * PAGE_SIZE;
        let segments = self.segments.read();
        match segments.get(segment_id).and_then(|s| s.as_ref()) {
            // SAFETY: offset < segment_size by construction of the modulo.
            Some(seg) => Ok(unsafe { seg.raw.as_mut_ptr().add(offset) }),
            None => bail!(
                "page {} of space '{}' resolves to unmounted segment {}",
                page_id,
                self.space_name,
                segment_id
            ),
        }
    }

    /// PM base address of a whole segment.
    pub fn segment_base(&self, segment_id: usize) -> Result<*mut u8> {
        let segments = self.segments.read();
        match segments.get(segment_id).and_then(|s| s.as_ref()) {
            Some(seg) => Ok(seg.raw.as_mut_ptr()),
            None => bail!("segment {} of space '{}' is not mounted", segment_id, self.space_name),
        }
    }

    /// Release segments `[start, end)` by renaming each to a fresh trailing
    /// index. The mapping (and the physical file) survives; only the index
    /// is retired. Segment 0 is never punched.
    pub fn punch(&self, start_segment: usize, end_segment: usize) -> Result<()> {
        ensure!(start_segment < end_segment, "empty punch range");
        ensure!(start_segment > 0, "segment 0 is reserved and cannot be punched");

        let mut segments = self.segments.write();
        for segment_id in start_segment..end_segment {
            let Some(mapping) = segments.get_mut(segment_id).and_then(Option::take) else {
                continue;
            };
            let new_id = segments.len();
            ensure!(
                new_id < self.max_segments,
                "space '{}' exhausted its segment table while punching",
                self.space_name
            );
            let new_path = self.segment_filename(new_id);
            fs::rename(&mapping.path, &new_path).wrap_err_with(|| {
                format!(
                    "failed to relink '{}' to '{}'",
                    mapping.path.display(),
                    new_path.display()
                )
            })?;
            debug!(
                space = %self.space_name,
                from = segment_id,
                to = new_id,
                "punched PM segment"
            );
            segments.push(Some(SegmentMap {
                raw: mapping.raw,
                path: new_path,
            }));
        }
        Ok(())
    }

    /// Durably write `src` at byte offset `vptr`, spanning at most two
    /// adjacent segments. The first part goes through the flushing copy;
    /// a straddling tail uses the non-flushing copy, whose fence orders it
    /// before the caller's next durability point.
    pub fn seek_and_write(&self, vptr: u64, src: &[u8]) -> Result<()> {
        let in_segment = (vptr % self.segment_size as u64) as usize;
        let segment_remain = self.segment_size - in_segment;
        let page_id = (vptr / PAGE_SIZE as u64) as PageId;
        let in_page = (vptr % PAGE_SIZE as u64) as usize;

        self.extend(page_id)?;
        let first = self.page_base(page_id)?;
        if segment_remain >= src.len() {
            // SAFETY: in_page + len <= segment_remain + in_page <= segment
            // bytes remaining past page_base's offset.
            unsafe { pmem::write_to_nvm(first.add(in_page), src) };
            return Ok(());
        }

        let (head, tail) = src.split_at(segment_remain);
        // SAFETY: head exactly fills the mounted segment's remainder.
        unsafe { pmem::write_to_nvm(first.add(in_page), head) };

        let next_segment = (vptr + segment_remain as u64) / self.segment_size as u64;
        let next_page = next_segment as PageId * self.pages_per_segment;
        self.extend(next_page)?;
        let second = self.page_base(next_page)?;
        ensure!(
            tail.len() <= self.segment_size,
            "write of {} bytes spans more than two segments",
            src.len()
        );
        // SAFETY: tail fits within the freshly mounted segment. The copy
        // itself does not flush; flush here so the whole write is durable
        // on return.
        unsafe {
            pmem::copy_no_flush(second, tail);
            pmem::flush(second, tail.len());
        }
        pmem::sfence();
        Ok(())
    }

    /// Read `dst.len()` bytes from byte offset `vptr`, spanning at most two
    /// adjacent segments.
    pub fn seek_and_read(&self, vptr: u64, dst: &mut [u8]) -> Result<()> {
        ensure!(dst.len() < self.segment_size, "read length overflows a segment");
        let in_segment = (vptr % self.segment_size as u64) as usize;
        let segment_remain = self.segment_size - in_segment;
        let page_id = (vptr / PAGE_SIZE as u64) as PageId;
        let in_page = (vptr % PAGE_SIZE as u64) as usize;

        self.extend(page_id)?;
        let first = self.page_base(page_id)?;
        let head_len = segment_remain.min(dst.len());
        // SAFETY: head_len bytes lie within the mounted segment.
        unsafe {
            std::ptr::copy_nonoverlapping(first.add(in_page), dst.as_mut_ptr(), head_len);
        }
        if head_len == dst.len() {
            return Ok(());
        }

        let next_segment = (vptr + segment_remain as u64) / self.segment_size as u64;
        let next_page = next_segment as PageId * self.pages_per_segment;
        self.extend(next_page)?;
        let second = self.page_base(next_page)?;
        let tail_len = dst.len() - head_len;
        // SAFETY: tail_len < segment_size by the ensure above.
        unsafe {
            std::ptr::copy_nonoverlapping(second, dst.as_mut_ptr().add(head_len), tail_len);
        }
        Ok(())
    }

    /// Drop every mapping. All previously returned addresses become
    /// invalid.
    pub fn unmount(&self) {
        self.segments.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn two_dir_config(root: &std::path::Path) -> Arc<DirectoryConfig> {
        let spec = format!(
            "{};{}",
            root.join("n0").display(),
            root.join("n1").display()
        );
        Arc::new(DirectoryConfig::new(&spec, false).unwrap())
    }

    #[test]
    fn new_creates_and_mounts_segment_zero() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());

        let file = LogicFile::new(config, "heap", 64 * 1024, 16, true).unwrap();

        assert_eq!(file.segment_count(), 1);
        assert!(dir.path().join("n0/heap.0").exists());
    }

    #[test]
    fn new_fails_when_absent_and_not_creating() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());

        assert!(LogicFile::new(config, "heap", 64 * 1024, 16, false).is_err());
    }

    #[test]
    fn segments_stripe_across_directories() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());
        let file = LogicFile::new(config, "heap", 64 * 1024, 16, true).unwrap();

        file.mount_segment(1, true).unwrap();
        file.mount_segment(2, true).unwrap();

        assert!(dir.path().join("n1/heap.1").exists());
        assert!(dir.path().join("n0/heap.2").exists());
    }

    #[test]
    fn page_base_addresses_within_and_across_segments() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());
        let seg_size = 16 * PAGE_SIZE;
        let file = LogicFile::new(config, "heap", seg_size, 16, true).unwrap();
        file.mount_segment(1, true).unwrap();

        let base0 = file.page_base(0).unwrap();
        let base1 = file.page_base(1).unwrap();
        assert_eq!(base1 as usize - base0 as usize, PAGE_SIZE);

        // First page of segment 1 resolves through a different mapping.
        let page = file.pages_per_segment();
        assert!(file.page_base(page).is_ok());
    }

    #[test]
    fn page_base_of_unmounted_segment_fails() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());
        let file = LogicFile::new(config, "heap", 16 * PAGE_SIZE, 16, true).unwrap();

        assert!(file.page_base(file.pages_per_segment()).is_err());
    }

    #[test]
    fn seek_write_read_roundtrip_within_segment() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());
        let file = LogicFile::new(config, "undo0", 16 * PAGE_SIZE, 16, true).unwrap();

        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        file.seek_and_write(1000, &payload).unwrap();

        let mut out = vec![0u8; payload.len()];
        file.seek_and_read(1000, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn seek_write_read_straddles_segment_boundary() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());
        let seg_size = 4 * PAGE_SIZE;
        let file = LogicFile::new(config, "undo0", seg_size, 16, true).unwrap();

        let payload: Vec<u8> = (0..512u32).map(|i| (i % 199) as u8).collect();
        let vptr = seg_size as u64 - 100;
        file.seek_and_write(vptr, &payload).unwrap();

        let mut out = vec![0u8; payload.len()];
        file.seek_and_read(vptr, &mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(file.segment_count(), 2);
    }

    #[test]
    fn punch_relinks_segment_to_trailing_index() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());
        let file = LogicFile::new(config, "undo0", 16 * PAGE_SIZE, 16, true).unwrap();
        file.mount_segment(1, true).unwrap();
        file.mount_segment(2, true).unwrap();

        file.punch(1, 2).unwrap();

        assert!(!dir.path().join("n1/undo0.1").exists());
        assert!(dir.path().join("n1/undo0.3").exists());
        assert!(file.page_base(file.pages_per_segment()).is_err());
        assert!(file.segment_base(3).is_ok());
    }

    #[test]
    fn punch_refuses_segment_zero() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());
        let file = LogicFile::new(config, "undo0", 16 * PAGE_SIZE, 16, true).unwrap();

        assert!(file.punch(0, 1).is_err());
    }

    #[test]
    fn remount_preserves_contents() {
        let dir = tempdir().unwrap();
        let config = two_dir_config(dir.path());
        {
            let file =
                LogicFile::new(config.clone(), "heap", 16 * PAGE_SIZE, 16, true).unwrap();
            file.seek_and_write(64, b"durable bytes").unwrap();
            file.unmount();
        }

        let file = LogicFile::new(config, "heap", 16 * PAGE_SIZE, 16, true).unwrap();
        let mut out = vec![0u8; 13];
        file.seek_and_read(64, &mut out).unwrap();
        assert_eq!(&out, b"durable bytes");
    }
}
