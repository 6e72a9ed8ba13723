use small_store::Database;

use crate::test_utils::{new_file_db, quiet_options, setup};

/// Fill the store, delete every second key, compact, reopen: the file
/// shrank to the target and every surviving key still loads.
#[test]
fn test_compaction_shrinks_file() {
    setup();
    let (db, base) = new_file_db("compact");
    let index = db.open_index(b"data").unwrap();

    let value = vec![0xCDu8; 500];
    let txn = db.begin().unwrap();
    for i in 0..2000u32 {
        index
            .store(&txn, format!("k{:06}", i).as_bytes(), &value)
            .unwrap();
    }
    txn.commit().unwrap();
    db.checkpoint().unwrap();

    let full_pages = db.stats().total_pages;

    let txn = db.begin().unwrap();
    for i in 0..2000u32 {
        if i % 2 == 0 {
            index.delete(&txn, format!("k{:06}", i).as_bytes()).unwrap();
        }
    }
    txn.commit().unwrap();
    db.checkpoint().unwrap();

    let target = full_pages / 2 + 16;
    let compacted = db.compact_file(target).unwrap();
    assert!(compacted, "compaction declined to run");
    assert!(
        db.stats().total_pages <= target,
        "file still at {} pages, target {}",
        db.stats().total_pages,
        target
    );

    for i in 0..2000u32 {
        let check = db.bogus();
        let value_read = index
            .load(&check, format!("k{:06}", i).as_bytes())
            .unwrap();
        assert_eq!(value_read.is_some(), i % 2 == 1, "k{:06}", i);
        if let Some(v) = value_read {
            assert_eq!(v, value);
        }
    }
    db.verify().unwrap();
    db.close().unwrap();
    drop(db);

    // the shrink survives a reopen
    let db = Database::open(quiet_options().base_file(base)).unwrap();
    assert!(db.stats().total_pages <= target);
    let index = db.find_index(b"data").unwrap().unwrap();
    let check = db.bogus();
    for i in (1..2000u32).step_by(2) {
        assert!(index
            .load(&check, format!("k{:06}", i).as_bytes())
            .unwrap()
            .is_some());
    }
    db.verify().unwrap();
}

/// An impossible target aborts cleanly and leaves the store intact.
#[test]
fn test_compaction_declines_impossible_target() {
    setup();
    let (db, _base) = new_file_db("compact-decline");
    let index = db.open_index(b"data").unwrap();

    let txn = db.begin().unwrap();
    for i in 0..500u32 {
        index
            .store(&txn, format!("k{:04}", i).as_bytes(), &[1u8; 400])
            .unwrap();
    }
    txn.commit().unwrap();
    db.checkpoint().unwrap();

    // 4 pages can never hold this much live data
    let compacted = db.compact_file(4).unwrap();
    assert!(!compacted);

    let check = db.bogus();
    for i in (0..500u32).step_by(61) {
        assert!(index
            .load(&check, format!("k{:04}", i).as_bytes())
            .unwrap()
            .is_some());
    }
    db.verify().unwrap();
}
