use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use small_store::{Database, PrepareHandler, SmallResult, Transaction};

use crate::test_utils::{crash_copy, new_file_db, new_mem_db, quiet_options, setup};

/// Reads inside a transaction see its own writes, including its own
/// pending (ghost) deletes, before commit.
#[test]
fn test_read_your_own_writes() {
    let db = new_mem_db();
    let index = db.open_index(b"ryw").unwrap();

    let txn = db.begin().unwrap();
    index.store(&txn, b"k", b"v1").unwrap();
    assert_eq!(index.load(&txn, b"k").unwrap().unwrap(), b"v1");

    index.store(&txn, b"k", b"v2").unwrap();
    assert_eq!(index.load(&txn, b"k").unwrap().unwrap(), b"v2");

    index.delete(&txn, b"k").unwrap();
    assert!(index.load(&txn, b"k").unwrap().is_none());

    // and a store after the delete revives it
    index.store(&txn, b"k", b"v3").unwrap();
    assert_eq!(index.load(&txn, b"k").unwrap().unwrap(), b"v3");
    txn.commit().unwrap();

    let check = db.bogus();
    assert_eq!(index.load(&check, b"k").unwrap().unwrap(), b"v3");
}

#[test]
fn test_reset_rolls_everything_back() {
    let db = new_mem_db();
    let index = db.open_index(b"rollback").unwrap();

    {
        let txn = db.begin().unwrap();
        index.store(&txn, b"keep", b"original").unwrap();
        txn.commit().unwrap();
    }

    let txn = db.begin().unwrap();
    index.store(&txn, b"keep", b"modified").unwrap();
    index.store(&txn, b"fresh", b"inserted").unwrap();
    index.delete(&txn, b"keep").unwrap();
    txn.reset().unwrap();

    let check = db.bogus();
    assert_eq!(index.load(&check, b"keep").unwrap().unwrap(), b"original");
    assert!(index.load(&check, b"fresh").unwrap().is_none());
    db.verify().unwrap();
}

#[test]
fn test_drop_without_commit_rolls_back() {
    let db = new_mem_db();
    let index = db.open_index(b"drop").unwrap();

    {
        let txn = db.begin().unwrap();
        index.store(&txn, b"k", b"pending").unwrap();
        // txn dropped here
    }

    let check = db.bogus();
    assert!(index.load(&check, b"k").unwrap().is_none());
}

#[test]
fn test_scopes_roll_back_partially() {
    let db = new_mem_db();
    let index = db.open_index(b"scopes").unwrap();

    let txn = db.begin().unwrap();
    index.store(&txn, b"outer", b"kept").unwrap();

    txn.enter().unwrap();
    index.store(&txn, b"inner", b"discarded").unwrap();
    index.store(&txn, b"outer", b"overwritten-inside").unwrap();
    txn.exit().unwrap();

    // the inner writes are gone, the outer one restored
    assert!(index.load(&txn, b"inner").unwrap().is_none());
    assert_eq!(index.load(&txn, b"outer").unwrap().unwrap(), b"kept");
    txn.commit().unwrap();

    let check = db.bogus();
    assert!(index.load(&check, b"inner").unwrap().is_none());
    assert_eq!(index.load(&check, b"outer").unwrap().unwrap(), b"kept");
}

#[test]
fn test_rollback_of_many_spilled_records() {
    let db = new_mem_db();
    let index = db.open_index(b"spill").unwrap();

    {
        let txn = db.begin().unwrap();
        for i in 0..500u32 {
            index
                .store(&txn, format!("base{:05}", i).as_bytes(), &[1u8; 100])
                .unwrap();
        }
        txn.commit().unwrap();
    }

    let txn = db.begin().unwrap();
    for i in 0..500u32 {
        index
            .store(&txn, format!("base{:05}", i).as_bytes(), &[2u8; 120])
            .unwrap();
    }
    for i in 500..700u32 {
        index
            .store(&txn, format!("base{:05}", i).as_bytes(), &[3u8; 80])
            .unwrap();
    }
    txn.reset().unwrap();

    let check = db.bogus();
    assert_eq!(index.count().unwrap(), 500);
    for i in (0..500u32).step_by(97) {
        let value = index
            .load(&check, format!("base{:05}", i).as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(value, vec![1u8; 100]);
    }
    db.verify().unwrap();
}

struct CommitOnRecover {
    invoked: Arc<AtomicBool>,
}

impl PrepareHandler for CommitOnRecover {
    fn recover(&self, txn: Transaction) -> SmallResult {
        self.invoked.store(true, Ordering::SeqCst);
        txn.commit()
    }
}

/// A prepared transaction survives a crash: recovery rebuilds it and
/// hands it to the registered handler, which commits it.
#[test]
fn test_prepared_transaction_recovery() {
    setup();
    let (db, base) = new_file_db("prepare");
    let index = db.open_index(b"2pc").unwrap();

    let txn = db.begin().unwrap();
    index.store(&txn, b"staged", b"by-prepare").unwrap();
    txn.prepare(7).unwrap();

    // crash: copy the on-disk state while the txn is neither committed
    // nor rolled back
    let copy = crash_copy(&base, "prepare-crash");
    txn.reset().unwrap();
    db.close().unwrap();
    drop(db);

    let invoked = Arc::new(AtomicBool::new(false));
    let handler = Arc::new(CommitOnRecover {
        invoked: Arc::clone(&invoked),
    });
    let db = Database::open(
        quiet_options()
            .base_file(copy)
            .prepare_handler(7, handler),
    )
    .unwrap();
    assert!(invoked.load(Ordering::SeqCst), "handler never invoked");

    let index = db.find_index(b"2pc").unwrap().unwrap();
    let check = db.bogus();
    assert_eq!(index.load(&check, b"staged").unwrap().unwrap(), b"by-prepare");
}
