use small_store::{Database, DurabilityMode};

use crate::test_utils::{crash_copy, new_file_db, quiet_options, setup};

/// 100 stores without a commit, then a crash: none are visible after
/// recovery.
#[test]
fn test_uncommitted_stores_invisible_after_crash() {
    setup();
    let (db, base) = new_file_db("crash-uncommitted");
    let index = db.open_index(b"data").unwrap();

    let txn = db.begin().unwrap();
    for i in 0..100u32 {
        index
            .store(&txn, format!("k{:04}", i).as_bytes(), b"uncommitted")
            .unwrap();
    }

    let copy = crash_copy(&base, "crash-uncommitted-copy");
    txn.reset().unwrap();
    db.close().unwrap();
    drop(db);

    let db = Database::open(quiet_options().base_file(copy)).unwrap();
    let index = db.open_index(b"data").unwrap();
    let check = db.bogus();
    for i in 0..100u32 {
        assert!(
            index
                .load(&check, format!("k{:04}", i).as_bytes())
                .unwrap()
                .is_none(),
            "uncommitted k{:04} leaked through recovery",
            i
        );
    }
    db.verify().unwrap();
}

/// 100 stores committed with SYNC durability, then a crash before any
/// checkpoint: all are recovered from the redo stream.
#[test]
fn test_committed_stores_recovered_from_redo() {
    setup();
    let (db, base) = new_file_db("crash-committed");
    let index = db.open_index(b"data").unwrap();

    let txn = db.begin_with(DurabilityMode::Sync).unwrap();
    for i in 0..100u32 {
        index
            .store(&txn, format!("k{:04}", i).as_bytes(), format!("v{}", i).as_bytes())
            .unwrap();
    }
    txn.commit().unwrap();

    let copy = crash_copy(&base, "crash-committed-copy");
    db.close().unwrap();
    drop(db);

    let db = Database::open(quiet_options().base_file(copy)).unwrap();
    let index = db.find_index(b"data").unwrap().unwrap();
    let check = db.bogus();
    for i in 0..100u32 {
        assert_eq!(
            index
                .load(&check, format!("k{:04}", i).as_bytes())
                .unwrap()
                .unwrap(),
            format!("v{}", i).as_bytes(),
            "committed k{:04} lost",
            i
        );
    }
    db.verify().unwrap();
}

/// A transaction live across a checkpoint is rolled back by recovery
/// through its persisted undo log.
#[test]
fn test_live_transaction_at_checkpoint_rolled_back() {
    setup();
    let (db, base) = new_file_db("crash-live");
    let index = db.open_index(b"data").unwrap();

    {
        let txn = db.begin_with(DurabilityMode::Sync).unwrap();
        index.store(&txn, b"committed", b"stays").unwrap();
        txn.commit().unwrap();
    }

    let txn = db.begin().unwrap();
    for i in 0..50u32 {
        index
            .store(&txn, format!("live{:04}", i).as_bytes(), b"in-flight")
            .unwrap();
    }
    index.store(&txn, b"committed", b"dirty-overwrite").unwrap();

    // checkpoint with the transaction still open: its dirty pages may
    // reach disk, backed by the persisted undo log
    db.checkpoint().unwrap();

    let copy = crash_copy(&base, "crash-live-copy");
    txn.reset().unwrap();
    db.close().unwrap();
    drop(db);

    let db = Database::open(quiet_options().base_file(copy)).unwrap();
    let index = db.find_index(b"data").unwrap().unwrap();
    let check = db.bogus();
    assert_eq!(index.load(&check, b"committed").unwrap().unwrap(), b"stays");
    for i in 0..50u32 {
        assert!(index
            .load(&check, format!("live{:04}", i).as_bytes())
            .unwrap()
            .is_none());
    }
    db.verify().unwrap();
}

/// Deletes recover too: committed deletes stay deleted after replay.
#[test]
fn test_committed_deletes_recovered() {
    setup();
    let (db, base) = new_file_db("crash-deletes");
    let index = db.open_index(b"data").unwrap();

    {
        let txn = db.begin_with(DurabilityMode::Sync).unwrap();
        for i in 0..20u32 {
            index
                .store(&txn, format!("k{:02}", i).as_bytes(), b"v")
                .unwrap();
        }
        txn.commit().unwrap();
    }
    db.checkpoint().unwrap();

    {
        let txn = db.begin_with(DurabilityMode::Sync).unwrap();
        for i in 0..20u32 {
            if i % 2 == 0 {
                index.delete(&txn, format!("k{:02}", i).as_bytes()).unwrap();
            }
        }
        txn.commit().unwrap();
    }

    let copy = crash_copy(&base, "crash-deletes-copy");
    db.close().unwrap();
    drop(db);

    let db = Database::open(quiet_options().base_file(copy)).unwrap();
    let index = db.find_index(b"data").unwrap().unwrap();
    let check = db.bogus();
    for i in 0..20u32 {
        let value = index.load(&check, format!("k{:02}", i).as_bytes()).unwrap();
        assert_eq!(value.is_some(), i % 2 == 1, "k{:02}", i);
    }
}

/// Indexes created after the last checkpoint are rebuilt during replay.
#[test]
fn test_index_created_after_checkpoint_recovered() {
    setup();
    let (db, base) = new_file_db("crash-new-index");
    // force a checkpoint so the index creation lands after it
    db.checkpoint().unwrap();

    let index = db.open_index(b"late").unwrap();
    let txn = db.begin_with(DurabilityMode::Sync).unwrap();
    index.store(&txn, b"k", b"v").unwrap();
    txn.commit().unwrap();

    let copy = crash_copy(&base, "crash-new-index-copy");
    db.close().unwrap();
    drop(db);

    let db = Database::open(quiet_options().base_file(copy)).unwrap();
    let index = db.find_index(b"late").unwrap().expect("index lost");
    let check = db.bogus();
    assert_eq!(index.load(&check, b"k").unwrap().unwrap(), b"v");
    db.verify().unwrap();
}
