//! # Store Lifecycle
//!
//! The process-wide singleton: one [`Db`] owns the tablespace, the undo
//! segment set, the CSN machinery and the background recovery/reclaim
//! thread. Everything else (tables, transactions) borrows from it.
//!
//! ## Opening
//!
//! - [`Db::init`] formats fresh storage: directories are cleared, the
//!   tablespace and every undo segment are created, the run watermark is
//!   bumped.
//! - [`Db::bootstrap`] attaches to existing storage: everything is
//!   mounted, the watermark is bumped, the global CSN floor is restored
//!   from `max(watermark base, largest committed CSN on PM)`, and the
//!   background thread first rolls back every transaction the previous
//!   run left in progress.
//!
//! [`Db::shutdown`] stops the background thread and unmaps all PM. It
//! deliberately does *not* roll back live transactions — that is exactly
//! what recovery is for on the next start.
//!
//! ## Threads
//!
//! Worker threads carry implicit state: a NUMA binding, an undo segment
//! attachment, per-table rowid allocation ranges and the freed-rowid
//! cache. All of it lives in a thread-local context keyed by the store's
//! instance id, created on first use and released when the thread exits
//! (or lazily replaced when the same thread talks to a re-opened store).

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::info;

use crate::config::constants::{MAX_TUPLE_LEN, MIN_TX_CSN};
use crate::config::{DirectoryConfig, StoreOptions};
use crate::heap::rowid_map::RowIdMap;
use crate::heap::tuple::RowId;
use crate::heap::vecstore::TableCache;
use crate::numa;
use crate::storage::{PageId, TableSpace};
use crate::txn::{ProcessArray, Transaction};
use crate::undo::{self, reclaim, UndoSet};

static NEXT_DB_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one table: its segment head, its declared row length, and
/// the shared row directory.
#[derive(Clone)]
pub struct Table {
    seg_head: PageId,
    row_len: u32,
    map: Arc<RowIdMap>,
}

impl Table {
    pub fn seg_head(&self) -> PageId {
        self.seg_head
    }

    pub fn row_len(&self) -> u32 {
        self.row_len
    }

    pub(crate) fn map(&self) -> &Arc<RowIdMap> {
        &self.map
    }
}

pub(crate) struct DbInner {
    id: u64,
    weak_self: Weak<DbInner>,
    space: Arc<TableSpace>,
    undo: UndoSet,
    proc_array: ProcessArray,
    row_maps: Mutex<HashMap<u32, Arc<RowIdMap>>>,
    stop: AtomicBool,
    recovered: AtomicBool,
    background: Mutex<Option<JoinHandle<()>>>,
}

struct ThreadContext {
    db_id: u64,
    db: Weak<DbInner>,
    node: usize,
    undo_seg: Option<usize>,
    tables: HashMap<u32, TableCache>,
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        if let (Some(db), Some(idx)) = (self.db.upgrade(), self.undo_seg) {
            db.undo.detach(idx);
        }
    }
}

thread_local! {
    static THREAD_CTX: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };
}

impl DbInner {
    pub(crate) fn proc_array(&self) -> &ProcessArray {
        &self.proc_array
    }

    pub(crate) fn undo_set(&self) -> &UndoSet {
        &self.undo
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn mark_recovered(&self) {
        self.recovered.store(true, Ordering::Release);
    }

    /// Row directory for a table, created on demand (recovery opens
    /// tables it has never seen through exactly this path).
    pub(crate) fn row_map(&self, seg_head: PageId, row_len: u32) -> Result<Arc<RowIdMap>> {
        let mut maps = self.row_maps.lock();
        if let Some(map) = maps.get(&seg_head) {
            ensure!(
                map.row_len() == row_len,
                "table {} opened with row length {} but stores rows of length {}",
                seg_head,
                row_len,
                map.row_len()
            );
            return Ok(map.clone());
        }
        let map = Arc::new(RowIdMap::new(self.space.clone(), seg_head, row_len)?);
        maps.insert(seg_head, map.clone());
        Ok(map)
    }

    fn with_ctx<R>(&self, f: impl FnOnce(&mut ThreadContext) -> R) -> R {
        THREAD_CTX.with(|cell| {
            let mut slot = cell.borrow_mut();
            let stale = match slot.as_ref() {
                Some(ctx) => ctx.db_id != self.id,
                None => true,
            };
            if stale {
                let node = self.undo.next_node();
                numa::bind_current_thread(node);
                *slot = Some(ThreadContext {
                    db_id: self.id,
                    db: self.weak_self.clone(),
                    node,
                    undo_seg: None,
                    tables: HashMap::new(),
                });
            }
            f(slot.as_mut().expect("context initialized above"))
        })
    }

    /// This thread's undo segment, attaching on first use and switching
    /// away from a full one.
    pub(crate) fn acquire_undo_segment(&self) -> Result<usize> {
        self.with_ctx(|ctx| {
            if let Some(idx) = ctx.undo_seg {
                if !self.undo.segment(idx).is_full() {
                    return Ok(idx);
                }
                self.undo.detach(idx);
                ctx.undo_seg = None;
            }
            let idx = self.undo.attach(ctx.node)?;
            ctx.undo_seg = Some(idx);
            Ok(idx)
        })
    }

    pub(crate) fn with_table_cache<R>(
        &self,
        seg_head: PageId,
        f: impl FnOnce(&mut TableCache) -> R,
    ) -> Result<R> {
        Ok(self.with_ctx(|ctx| f(ctx.tables.entry(seg_head).or_default())))
    }

    /// Rowids of rolled-back inserts return to this thread's cache.
    pub(crate) fn return_freed_rowids(&self, freed: &[(PageId, RowId)]) {
        if freed.is_empty() {
            return;
        }
        self.with_ctx(|ctx| {
            for (seg_head, row_id) in freed {
                ctx.tables
                    .entry(*seg_head)
                    .or_default()
                    .rowid_cache
                    .push(*row_id);
            }
        });
    }
}

/// The store.
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Format fresh storage in the configured directories and start the
    /// background thread.
    pub fn init(options: &StoreOptions) -> Result<Db> {
        Self::open(options, true)
    }

    /// Attach to existing storage and run crash recovery in the
    /// background.
    pub fn bootstrap(options: &StoreOptions) -> Result<Db> {
        Self::open(options, false)
    }

    fn open(options: &StoreOptions, init: bool) -> Result<Db> {
        let dir_config = Arc::new(DirectoryConfig::new(&options.dir_paths, init)?);

        let space = Arc::new(if init {
            TableSpace::create(dir_config.clone(), options.tablespace_segment_size)?
        } else {
            TableSpace::open(dir_config.clone(), options.tablespace_segment_size)?
        });

        let undo = if init {
            UndoSet::create(
                dir_config.clone(),
                options.undo_segment_count,
                options.undo_segment_size,
            )?
        } else {
            UndoSet::mount(
                dir_config.clone(),
                options.undo_segment_count,
                options.undo_segment_size,
            )?
        };

        let base_csn = undo::bump_watermark(&dir_config)?;
        let max_undo_csn = if init {
            MIN_TX_CSN
        } else {
            undo.check_recover_watermark()
        };
        let initial_csn = base_csn.max(max_undo_csn).max(MIN_TX_CSN);

        let inner = Arc::new_cyclic(|weak| DbInner {
            id: NEXT_DB_ID.fetch_add(1, Ordering::Relaxed),
            weak_self: weak.clone(),
            space,
            undo,
            proc_array: ProcessArray::new(initial_csn),
            row_maps: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            background: Mutex::new(None),
        });

        let handle = std::thread::Builder::new()
            .name("pmheap-undo".into())
            .spawn({
                let inner = inner.clone();
                move || reclaim::background_main(inner)
            })
            .wrap_err("failed to spawn the undo background thread")?;
        *inner.background.lock() = Some(handle);

        info!(init, csn = initial_csn, "store opened");
        Ok(Db { inner })
    }

    /// Begin a transaction at the current global CSN.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::begin(&self.inner)
    }

    /// Create a table of fixed-width rows; returns its handle. The
    /// segment head page id is the table's persistent identity — callers
    /// keep it to re-open the table after a restart.
    pub fn create_table(&self, row_len: u32) -> Result<Table> {
        ensure!(
            row_len > 0 && row_len as usize <= MAX_TUPLE_LEN,
            "row length {} out of range",
            row_len
        );
        let seg_head = self.inner.space.alloc_extent(numa::current_node())?;
        let map = self.inner.row_map(seg_head, row_len)?;
        Ok(Table {
            seg_head,
            row_len,
            map,
        })
    }

    /// Re-open a table by its segment head.
    pub fn open_table(&self, seg_head: PageId, row_len: u32) -> Result<Table> {
        let map = self.inner.row_map(seg_head, row_len)?;
        Ok(Table {
            seg_head,
            row_len,
            map,
        })
    }

    /// Block until crash recovery has finished (immediately true for a
    /// freshly initialized store).
    pub fn wait_for_recovery(&self) {
        while !self.inner.recovered.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Current global CSN (the snapshot a transaction beginning now would
    /// observe).
    pub fn global_csn(&self) -> u64 {
        self.inner.proc_array.current_csn()
    }

    /// Stop the background thread and unmap every PM segment. Live
    /// transactions are NOT rolled back; the next bootstrap recovers
    /// them. Tables and transactions of this store must not be used
    /// afterwards.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.inner.background.lock().take() {
            handle
                .join()
                .map_err(|_| eyre::eyre!("undo background thread panicked"))?;
        }
        self.inner.undo.unmount_all();
        self.inner.space.unmount();
        info!("store shut down");
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
