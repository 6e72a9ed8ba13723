use small_store::{Database, DurabilityMode, ErrorKind};

use crate::test_utils::{new_file_db, new_mem_db, quiet_options, random_pairs, setup};

/// Write in a transaction, read it back in the same transaction, commit,
/// reopen the store, and read it again.
#[test]
fn test_write_read_single_txn() {
    let (db, base) = new_file_db("write-read");
    let index = db.open_index(b"test").unwrap();

    let txn = db.begin_with(DurabilityMode::Sync).unwrap();
    index.store(&txn, b"hello", b"world").unwrap();
    assert_eq!(index.load(&txn, b"hello").unwrap().unwrap(), b"world");
    txn.commit().unwrap();

    db.close().unwrap();
    drop(db);

    let db = Database::open(quiet_options().base_file(base)).unwrap();
    let index = db.open_index(b"test").unwrap();
    let txn = db.bogus();
    assert_eq!(index.load(&txn, b"hello").unwrap().unwrap(), b"world");
}

#[test]
fn test_store_load_delete_round_trip() {
    let db = new_mem_db();
    let index = db.open_index(b"rt").unwrap();

    for (key, value) in random_pairs(200, 50) {
        let txn = db.begin().unwrap();
        index.store(&txn, &key, &value).unwrap();
        assert_eq!(index.load(&txn, &key).unwrap().unwrap(), value);
        txn.commit().unwrap();

        let txn = db.begin().unwrap();
        index.delete(&txn, &key).unwrap();
        assert!(index.load(&txn, &key).unwrap().is_none());
        txn.commit().unwrap();

        let check = db.bogus();
        assert!(index.load(&check, &key).unwrap().is_none());
    }
    db.verify().unwrap();
}

/// Storing the same value repeatedly leaves the tree size unchanged
/// after the first store.
#[test]
fn test_repeated_store_is_idempotent() {
    let db = new_mem_db();
    let index = db.open_index(b"idem").unwrap();

    let txn = db.begin().unwrap();
    for _ in 0..50 {
        index.store(&txn, b"k", b"same value every time").unwrap();
    }
    txn.commit().unwrap();
    assert_eq!(index.count().unwrap(), 1);
}

#[test]
fn test_empty_key_and_empty_value() {
    let db = new_mem_db();
    let index = db.open_index(b"empty").unwrap();

    let txn = db.begin().unwrap();
    index.store(&txn, b"", b"value-at-empty-key").unwrap();
    index.store(&txn, b"empty-value", b"").unwrap();
    txn.commit().unwrap();

    let check = db.bogus();
    assert_eq!(
        index.load(&check, b"").unwrap().unwrap(),
        b"value-at-empty-key"
    );
    // an empty value is present, which is distinct from absent
    assert_eq!(index.load(&check, b"empty-value").unwrap().unwrap(), b"");
    assert!(index.load(&check, b"never-stored").unwrap().is_none());
}

#[test]
fn test_many_indexes_are_independent() {
    let db = new_mem_db();
    let a = db.open_index(b"a").unwrap();
    let b = db.open_index(b"b").unwrap();

    let txn = db.begin().unwrap();
    a.store(&txn, b"k", b"from-a").unwrap();
    b.store(&txn, b"k", b"from-b").unwrap();
    txn.commit().unwrap();

    let check = db.bogus();
    assert_eq!(a.load(&check, b"k").unwrap().unwrap(), b"from-a");
    assert_eq!(b.load(&check, b"k").unwrap().unwrap(), b"from-b");

    // find_index sees only what exists
    assert!(db.find_index(b"a").unwrap().is_some());
    assert!(db.find_index(b"missing").unwrap().is_none());
}

#[test]
fn test_index_rename_and_drop() {
    let db = new_mem_db();
    let index = db.open_index(b"old-name").unwrap();
    let txn = db.begin().unwrap();
    index.store(&txn, b"k", b"v").unwrap();
    txn.commit().unwrap();

    db.rename_index(&index, b"new-name").unwrap();
    assert!(db.find_index(b"old-name").unwrap().is_none());
    let renamed = db.find_index(b"new-name").unwrap().unwrap();
    let check = db.bogus();
    assert_eq!(renamed.load(&check, b"k").unwrap().unwrap(), b"v");

    // a non-empty index refuses to drop
    let err = db.drop_index(renamed.clone()).unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::Other);

    let txn = db.begin().unwrap();
    renamed.delete(&txn, b"k").unwrap();
    txn.commit().unwrap();
    db.drop_index(renamed).unwrap();
    assert!(db.find_index(b"new-name").unwrap().is_none());
}

#[test]
fn test_double_open_rejected() {
    setup();
    let (db, base) = new_file_db("double-open");
    let err = Database::open(quiet_options().base_file(base.clone())).unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::Other);

    db.close().unwrap();
    drop(db);
    // after the first handle is gone the file opens fine
    let db = Database::open(quiet_options().base_file(base)).unwrap();
    db.verify().unwrap();
}

#[test]
fn test_read_only_refuses_mutation() {
    let (db, base) = new_file_db("read-only");
    let index = db.open_index(b"ro").unwrap();
    let txn = db.begin().unwrap();
    index.store(&txn, b"k", b"v").unwrap();
    txn.commit().unwrap();
    db.close().unwrap();
    drop(db);

    let db = Database::open(quiet_options().base_file(base).read_only(true)).unwrap();
    let index = db.find_index(b"ro").unwrap().unwrap();
    let check = db.bogus();
    assert_eq!(index.load(&check, b"k").unwrap().unwrap(), b"v");

    let txn = db.begin().unwrap();
    assert!(index.store(&txn, b"k2", b"v2").is_err());
}

#[test]
fn test_closed_database_reports_closed() {
    let db = new_mem_db();
    let index = db.open_index(b"closing").unwrap();
    db.close().unwrap();
    let err = db.begin().unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::Closed);
    let txn_err = db.open_index(b"other").unwrap_err();
    assert_eq!(txn_err.get_kind(), ErrorKind::Closed);
    drop(index);
}
