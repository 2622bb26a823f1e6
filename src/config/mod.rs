//! # Store Configuration
//!
//! Two things live here: the [`DirectoryConfig`] that maps NUMA nodes to PM
//! mount points, and the [`StoreOptions`] the process is opened with.
//!
//! ## Directory Layout
//!
//! The store is given a semicolon-delimited list of directories, one per
//! NUMA node and in node order:
//!
//! ```text
//! /mnt/pmem0/db;/mnt/pmem1/db
//! ```
//!
//! Directory `i` holds the tablespace segments whose index is congruent to
//! `i` modulo the directory count, the undo segments whose id is congruent
//! to `i`, and (for directory 0 only) the watermark file:
//!
//! ```text
//! /mnt/pmem0/db/heap.0          tablespace segment 0
//! /mnt/pmem0/db/heap.2          tablespace segment 2   (2 dirs)
//! /mnt/pmem0/db/undo0.0         undo segment 0, file 0
//! /mnt/pmem0/db/watermark.0     run counter
//! /mnt/pmem1/db/heap.1          tablespace segment 1
//! /mnt/pmem1/db/undo1.0         undo segment 1, file 0
//! ```
//!
//! A thread pinned to node `n` allocates extents and undo space from
//! directory `n`; striping by segment index keeps that placement stable.

pub mod constants;

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};

use constants::MAX_NUMA_DIRS;

/// Ordered list of NUMA-local PM mount points.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    dir_paths: Vec<PathBuf>,
}

impl DirectoryConfig {
    /// Parse a semicolon-delimited directory list. With `init`, existing
    /// contents are removed and the directories are recreated empty.
    pub fn new(dir_paths: &str, init: bool) -> Result<Self> {
        let paths: Vec<PathBuf> = dir_paths
            .split(';')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        ensure!(!paths.is_empty(), "no PM directories configured");
        ensure!(
            paths.len() <= MAX_NUMA_DIRS,
            "{} PM directories configured, at most {} supported",
            paths.len(),
            MAX_NUMA_DIRS
        );

        if init {
            for path in &paths {
                if path.exists() {
                    fs::remove_dir_all(path).wrap_err_with(|| {
                        format!("failed to clear PM directory '{}'", path.display())
                    })?;
                }
            }
        }
        for path in &paths {
            fs::create_dir_all(path).wrap_err_with(|| {
                format!("failed to create PM directory '{}'", path.display())
            })?;
        }

        Ok(Self { dir_paths: paths })
    }

    /// Config over a single already-created directory. Undo segments use
    /// this to pin their logic file to the segment's home directory.
    pub fn single(dir: PathBuf) -> Self {
        Self {
            dir_paths: vec![dir],
        }
    }

    pub fn dir_count(&self) -> usize {
        self.dir_paths.len()
    }

    /// Directory for a striped index (segment id, undo id, ...).
    pub fn dir_by_index(&self, index: usize) -> &Path {
        &self.dir_paths[index % self.dir_paths.len()]
    }

    pub fn dir_id_by_index(&self, index: usize) -> usize {
        index % self.dir_paths.len()
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dir_paths
    }
}

/// Options the store is initialized or bootstrapped with.
///
/// Segment sizes are configurable so tests can run against small files;
/// the defaults match production sizing (1 GiB tablespace segments,
/// 16 MiB undo segments).
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub dir_paths: String,
    pub tablespace_segment_size: usize,
    pub undo_segment_size: usize,
    pub undo_segment_count: usize,
}

impl StoreOptions {
    pub fn new(dir_paths: impl Into<String>) -> Self {
        Self {
            dir_paths: dir_paths.into(),
            tablespace_segment_size: 1024 * 1024 * 1024,
            undo_segment_size: 16 * 1024 * 1024,
            undo_segment_count: 64,
        }
    }

    pub fn tablespace_segment_size(mut self, size: usize) -> Self {
        self.tablespace_segment_size = size;
        self
    }

    pub fn undo_segment_size(mut self, size: usize) -> Self {
        self.undo_segment_size = size;
        self
    }

    pub fn undo_segment_count(mut self, count: usize) -> Self {
        self.undo_segment_count = count;
        self
    }
}
