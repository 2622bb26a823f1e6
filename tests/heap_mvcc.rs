//! # MVCC Heap Semantics
//!
//! End-to-end checks of the insert/read/update/delete paths against one
//! live store: snapshot isolation, write-write conflicts, self-visibility,
//! rollback restoration and rowid reservation.
//!
//! Stores run against small segment sizes so a test directory stays in
//! the tens of megabytes.

use pmheap::{
    heap_delete, heap_insert, heap_insert_empty, heap_read, heap_update, heap_update_delta,
    heap_upper_row_id, Db, HeapStatus, RamTuple, StoreOptions, INVALID_ROW_ID,
};
use tempfile::tempdir;

const ROW_LEN: u32 = 100;

fn options(root: &std::path::Path) -> StoreOptions {
    StoreOptions::new(root.join("pm0").display().to_string())
        .tablespace_segment_size(8 * 1024 * 1024)
        .undo_segment_size(512 * 1024)
        .undo_segment_count(4)
}

fn row(byte: u8) -> RamTuple {
    RamTuple::with_data(ROW_LEN, &[byte; ROW_LEN as usize])
}

#[test]
fn insert_then_read_across_transactions() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut t1 = db.begin().unwrap();
    let rid = heap_insert(&mut t1, &table, &mut row(0x41)).unwrap();
    assert_eq!(rid, 0);
    t1.commit().unwrap();

    let t2 = db.begin().unwrap();
    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&t2, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    assert_eq!(out.data(), &[0x41; ROW_LEN as usize][..]);
    t2.commit().unwrap();
}

#[test]
fn insert_is_visible_to_its_own_transaction() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut tx = db.begin().unwrap();
    let rid = heap_insert(&mut tx, &table, &mut row(0x7E)).unwrap();

    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&tx, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    assert_eq!(out.data(), &[0x7E; ROW_LEN as usize][..]);
    tx.commit().unwrap();
}

#[test]
fn never_written_row_reads_as_not_used() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let tx = db.begin().unwrap();
    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(
        heap_read(&tx, &table, 5, &mut out).unwrap(),
        HeapStatus::ReadRowNotUsed
    );
    tx.commit().unwrap();
}

#[test]
fn conflicting_updates_abort_the_second_writer() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut setup = db.begin().unwrap();
    let rid = heap_insert(&mut setup, &table, &mut row(0x00)).unwrap();
    setup.commit().unwrap();

    // T1 updates the row.
    let mut t1 = db.begin().unwrap();
    let mut t1_row = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&t1, &table, rid, &mut t1_row).unwrap(), HeapStatus::Ok);
    t1_row.update_range(0, &[0x11]);
    assert_eq!(heap_update(&mut t1, &table, rid, &mut t1_row).unwrap(), HeapStatus::Ok);

    // T2 sees the pre-update version but cannot write.
    let mut t2 = db.begin().unwrap();
    let mut t2_row = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&t2, &table, rid, &mut t2_row).unwrap(), HeapStatus::Ok);
    assert_eq!(t2_row.data()[0], 0x00);
    t2_row.update_range(0, &[0x22]);
    assert_eq!(
        heap_update(&mut t2, &table, rid, &mut t2_row).unwrap(),
        HeapStatus::UpdateConflict
    );

    // T2 is doomed until it aborts.
    let mut scratch = RamTuple::new(ROW_LEN);
    assert_eq!(
        heap_read(&t2, &table, rid, &mut scratch).unwrap(),
        HeapStatus::WaitAbort
    );
    t2.abort().unwrap();

    t1.commit().unwrap();

    // A later snapshot sees T1's value.
    let t3 = db.begin().unwrap();
    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&t3, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    assert_eq!(out.data()[0], 0x11);
    t3.commit().unwrap();
}

#[test]
fn snapshot_does_not_see_later_commits() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut setup = db.begin().unwrap();
    heap_insert(&mut setup, &table, &mut row(0x01)).unwrap();
    setup.commit().unwrap();

    // T1's snapshot predates T2's insert.
    let t1 = db.begin().unwrap();

    let mut t2 = db.begin().unwrap();
    let rid = heap_insert(&mut t2, &table, &mut row(0x02)).unwrap();
    t2.commit().unwrap();

    let mut out = RamTuple::new(ROW_LEN);
    let status = heap_read(&t1, &table, rid, &mut out).unwrap();
    assert!(
        matches!(status, HeapStatus::NoVisibleVersion | HeapStatus::ReadRowNotUsed),
        "snapshot leaked a later commit: {status:?}"
    );
    t1.commit().unwrap();

    // A fresh snapshot does see it.
    let t3 = db.begin().unwrap();
    assert_eq!(heap_read(&t3, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    t3.commit().unwrap();
}

#[test]
fn readers_see_the_old_version_under_a_live_writer() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut setup = db.begin().unwrap();
    let rid = heap_insert(&mut setup, &table, &mut row(0xAA)).unwrap();
    setup.commit().unwrap();

    let mut writer = db.begin().unwrap();
    let mut new_row = RamTuple::new(ROW_LEN);
    heap_read(&writer, &table, rid, &mut new_row).unwrap();
    new_row.update_range(10, &[0xBB, 0xBB]);
    heap_update(&mut writer, &table, rid, &mut new_row).unwrap();

    // Uncommitted: a reader walks the chain back to 0xAA everywhere.
    let reader = db.begin().unwrap();
    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&reader, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    assert_eq!(out.data(), &[0xAA; ROW_LEN as usize][..]);
    reader.commit().unwrap();
    writer.commit().unwrap();
}

#[test]
fn update_then_abort_restores_the_row_bitwise() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut setup = db.begin().unwrap();
    let rid = heap_insert(&mut setup, &table, &mut row(0x5C)).unwrap();
    setup.commit().unwrap();

    let mut tx = db.begin().unwrap();
    let mut changed = RamTuple::new(ROW_LEN);
    heap_read(&tx, &table, rid, &mut changed).unwrap();
    changed.update_range(0, &[0xFF; 32]);
    assert_eq!(heap_update(&mut tx, &table, rid, &mut changed).unwrap(), HeapStatus::Ok);
    tx.abort().unwrap();

    let check = db.begin().unwrap();
    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&check, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    assert_eq!(out.data(), &[0x5C; ROW_LEN as usize][..]);
    check.commit().unwrap();
}

#[test]
fn delta_update_touches_only_tracked_ranges() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut setup = db.begin().unwrap();
    let rid = heap_insert(&mut setup, &table, &mut row(0x10)).unwrap();
    setup.commit().unwrap();

    let mut tx = db.begin().unwrap();
    let mut delta = RamTuple::new(ROW_LEN);
    heap_read(&tx, &table, rid, &mut delta).unwrap();
    delta.update_range(20, &[0xEE, 0xEF, 0xF0]);
    assert_eq!(
        heap_update_delta(&mut tx, &table, rid, &mut delta).unwrap(),
        HeapStatus::Ok
    );
    tx.commit().unwrap();

    let check = db.begin().unwrap();
    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&check, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    assert_eq!(&out.data()[20..23], &[0xEE, 0xEF, 0xF0]);
    assert!(out.data()[..20].iter().all(|&b| b == 0x10));
    assert!(out.data()[23..].iter().all(|&b| b == 0x10));
    check.commit().unwrap();
}

#[test]
fn delete_is_a_tombstone_for_later_snapshots_only() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut setup = db.begin().unwrap();
    let rid = heap_insert(&mut setup, &table, &mut row(0x33)).unwrap();
    setup.commit().unwrap();

    // Old snapshot taken before the delete commits.
    let old = db.begin().unwrap();

    let mut deleter = db.begin().unwrap();
    assert_eq!(heap_delete(&mut deleter, &table, rid).unwrap(), HeapStatus::Ok);
    deleter.commit().unwrap();

    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&old, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    assert_eq!(out.data(), &[0x33; ROW_LEN as usize][..]);
    old.commit().unwrap();

    let fresh = db.begin().unwrap();
    assert_eq!(
        heap_read(&fresh, &table, rid, &mut out).unwrap(),
        HeapStatus::RowDeleted
    );
    fresh.commit().unwrap();

    // Updating a visibly deleted row is an error and dooms the writer.
    let mut doomed = db.begin().unwrap();
    let mut patch = RamTuple::new(ROW_LEN);
    patch.update_range(0, &[1]);
    assert_eq!(
        heap_update(&mut doomed, &table, rid, &mut patch).unwrap(),
        HeapStatus::RowDeleted
    );
    doomed.abort().unwrap();
}

#[test]
fn delete_then_abort_revives_the_row() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut setup = db.begin().unwrap();
    let rid = heap_insert(&mut setup, &table, &mut row(0x66)).unwrap();
    setup.commit().unwrap();

    let mut tx = db.begin().unwrap();
    assert_eq!(heap_delete(&mut tx, &table, rid).unwrap(), HeapStatus::Ok);
    tx.abort().unwrap();

    let check = db.begin().unwrap();
    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&check, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    assert_eq!(out.data(), &[0x66; ROW_LEN as usize][..]);
    check.commit().unwrap();
}

#[test]
fn insert_rollback_frees_the_rowid_for_reuse() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut tx = db.begin().unwrap();
    let rid = heap_insert(&mut tx, &table, &mut row(0x01)).unwrap();
    tx.abort().unwrap();

    // The freed rowid comes back to this thread first.
    let mut tx2 = db.begin().unwrap();
    let rid2 = heap_insert(&mut tx2, &table, &mut row(0x02)).unwrap();
    assert_eq!(rid2, rid);
    tx2.commit().unwrap();
}

#[test]
fn insert_empty_hands_back_a_zeroed_row() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut tx = db.begin().unwrap();
    let (tuple, rid) = heap_insert_empty(&mut tx, &table).unwrap();
    assert_ne!(rid, INVALID_ROW_ID);
    assert!(tuple.data().iter().all(|&b| b == 0));
    tx.commit().unwrap();

    let check = db.begin().unwrap();
    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(heap_read(&check, &table, rid, &mut out).unwrap(), HeapStatus::Ok);
    assert!(out.data().iter().all(|&b| b == 0));
    check.commit().unwrap();
}

#[test]
fn upper_row_id_bounds_allocated_rows() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    let mut tx = db.begin().unwrap();
    let rid = heap_insert(&mut tx, &table, &mut row(0x01)).unwrap();
    tx.commit().unwrap();

    let upper = heap_upper_row_id(&table).unwrap();
    assert!(rid < upper);

    // The last rowid under the bound is addressable (merely unused).
    let tx = db.begin().unwrap();
    let mut out = RamTuple::new(ROW_LEN);
    assert_eq!(
        heap_read(&tx, &table, upper - 1, &mut out).unwrap(),
        HeapStatus::ReadRowNotUsed
    );
    tx.commit().unwrap();
}

#[test]
fn concurrent_inserts_reserve_disjoint_rowids() {
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let table = db.create_table(ROW_LEN).unwrap();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 100;

    let mut all: Vec<u32> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let db = &db;
                let table = table.clone();
                scope.spawn(move || {
                    let mut rids = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        let mut tx = db.begin().unwrap();
                        let rid = heap_insert(&mut tx, &table, &mut row(0x44)).unwrap();
                        tx.commit().unwrap();
                        rids.push(rid);
                    }
                    rids
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    all.sort_unstable();
    let before = all.len();
    all.dedup();
    assert_eq!(all.len(), before, "two inserts shared a rowid");
}

#[test]
fn two_tables_are_independent()
{
    let dir = tempdir().unwrap();
    let db = Db::init(&options(dir.path())).unwrap();
    let t1 = db.create_table(ROW_LEN).unwrap();
    let t2 = db.create_table(16).unwrap();

    let mut tx = db.begin().unwrap();
    let r1 = heap_insert(&mut tx, &t1, &mut row(0x77)).unwrap();
    let mut small = RamTuple::with_data(16, &[0x88; 16]);
    let r2 = heap_insert(&mut tx, &t2, &mut small).unwrap();
    tx.commit().unwrap();

    let check = db.begin().unwrap();
    let mut out1 = RamTuple::new(ROW_LEN);
    let mut out2 = RamTuple::new(16);
    assert_eq!(heap_read(&check, &t1, r1, &mut out1).unwrap(), HeapStatus::Ok);
    assert_eq!(heap_read(&check, &t2, r2, &mut out2).unwrap(), HeapStatus::Ok);
    assert_eq!(out1.data()[0], 0x77);
    assert_eq!(out2.data()[0], 0x88);
    check.commit().unwrap();
}
