//! # pmheap — Persistent-Memory MVCC Row Store
//!
//! pmheap stores fixed-width rows on byte-addressable persistent memory
//! and coordinates concurrent transactions over them with multi-version
//! concurrency control. Storage is divided across NUMA-local directories;
//! durability comes from cache-line flushes and store fences, never from
//! a block-device write path.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │      Db: init / bootstrap / shutdown          │
//! ├───────────────────────────────────────────────┤
//! │ Transactions: CSN, snapshots, visibility      │
//! ├───────────────────────┬───────────────────────┤
//! │ Heap ops + row        │ Undo engine: TxSlots, │
//! │ directory (DRAM)      │ records, reclaim      │
//! ├───────────────────────┴───────────────────────┤
//! │ TableSpace: 2 MiB extents, NUMA striping      │
//! ├───────────────────────────────────────────────┤
//! │ LogicFile: mmap'd PM segment files            │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## The MVCC Encoding
//!
//! Every row version carries a 64-bit `tx_info`. Its top bit tells the
//! whole story: set means the version is committed and the field is its
//! commit sequence number; clear means the field points at the writer's
//! transaction slot in an undo segment. Old versions are never kept in
//! the heap — they are reconstructed from undo records hanging off the
//! version's `prev` pointer.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pmheap::{Db, StoreOptions};
//! use pmheap::heap::access::{heap_insert, heap_read};
//! use pmheap::heap::tuple::RamTuple;
//!
//! let db = Db::init(&StoreOptions::new("/mnt/pmem0/db;/mnt/pmem1/db"))?;
//! let table = db.create_table(100)?;
//!
//! let mut tx = db.begin()?;
//! let mut row = RamTuple::with_data(100, &[0x41; 100]);
//! let rid = heap_insert(&mut tx, &table, &mut row)?;
//! tx.commit()?;
//!
//! let tx = db.begin()?;
//! let mut out = RamTuple::new(100);
//! heap_read(&tx, &table, rid, &mut out)?;
//! ```
//!
//! ## File Layout
//!
//! ```text
//! <dir_i>/heap.<seg>       tablespace segments, striped by seg % dirs
//! <dir_i>/undo<id>.<seg>   undo segments, id % dirs == i
//! <dir_0>/watermark.0      8-byte monotonic run counter
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: directory list, store options, layout constants
//! - [`pmem`]: flush/fence copy primitives
//! - [`numa`]: topology and thread pinning
//! - [`storage`]: LogicFile and TableSpace
//! - [`heap`]: tuples, row directory, allocation, heap operations
//! - [`undo`]: undo segments, records, recovery, reclamation
//! - [`txn`]: CSNs, snapshots, transactions

pub mod config;
pub mod db;
pub mod heap;
pub mod numa;
pub mod pmem;
pub mod storage;
pub mod txn;
pub mod undo;

pub use config::constants::{INVALID_ROW_ID, MIN_TX_CSN};
pub use config::StoreOptions;
pub use db::{Db, Table};
pub use heap::access::{
    heap_delete, heap_insert, heap_insert_empty, heap_read, heap_update, heap_update_delta,
    heap_upper_row_id,
};
pub use heap::tuple::{RamTuple, RowId};
pub use heap::{force_write_back_csn, set_force_write_back_csn, HeapStatus};
pub use txn::{TmResult, Transaction, TxStatus};
