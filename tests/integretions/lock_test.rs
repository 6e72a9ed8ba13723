use std::sync::Arc;
use std::thread;
use std::time::Duration;

use small_store::{Database, ErrorKind, LockUpgradeRule};

use crate::test_utils::{new_mem_db, quiet_options, setup};

/// Two transactions colliding on one key serialise through the lock
/// manager; the second only proceeds once the first commits.
#[test]
fn test_conflicting_writes_serialise() {
    let db = new_mem_db();
    let index = db.open_index(b"locks").unwrap();

    let t1 = db.begin().unwrap();
    index.store(&t1, b"k", b"one").unwrap();

    let db2 = db.clone();
    let index2 = index.clone();
    let handle = thread::spawn(move || {
        let mut t2 = db2.begin().unwrap();
        t2.set_lock_timeout_nanos(-1);
        index2.store(&t2, b"k", b"two").unwrap();
        t2.commit().unwrap();
    });

    thread::sleep(Duration::from_millis(100));
    // t2 is parked on the lock; our value is still in place
    assert_eq!(index.load(&t1, b"k").unwrap().unwrap(), b"one");
    t1.commit().unwrap();
    handle.join().unwrap();

    let check = db.bogus();
    assert_eq!(index.load(&check, b"k").unwrap().unwrap(), b"two");
}

#[test]
fn test_zero_timeout_times_out_immediately() {
    let db = new_mem_db();
    let index = db.open_index(b"timeouts").unwrap();

    let t1 = db.begin().unwrap();
    index.store(&t1, b"contested", b"v").unwrap();

    let mut t2 = db.begin().unwrap();
    t2.set_lock_timeout_nanos(0);
    let err = index.load(&t2, b"contested").unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::LockTimeout);

    // the transaction survives a timeout and can work elsewhere
    index.store(&t2, b"other", b"fine").unwrap();
    t2.commit().unwrap();
    t1.commit().unwrap();
}

/// T1 holds K1 and wants K2; T2 holds K2 and asks for K1, closing the
/// cycle. T2 gets the deadlock error; after it backs off T1 completes.
#[test]
fn test_deadlock_detection() {
    let db = new_mem_db();
    let index = db.open_index(b"deadlock").unwrap();

    {
        let txn = db.begin().unwrap();
        index.store(&txn, b"k1", b"init").unwrap();
        index.store(&txn, b"k2", b"init").unwrap();
        txn.commit().unwrap();
    }

    let mut t1 = db.begin().unwrap();
    t1.set_lock_timeout_nanos(10_000_000_000);
    index.store(&t1, b"k1", b"t1").unwrap();

    let t2 = db.begin().unwrap();
    index.store(&t2, b"k2", b"t2").unwrap();

    let db2 = db.clone();
    let index2 = index.clone();
    let t1 = Arc::new(t1);
    let t1_thread = Arc::clone(&t1);
    let blocked = thread::spawn(move || {
        // blocks behind t2
        index2.store(&t1_thread, b"k2", b"t1-wants").unwrap();
        drop(db2);
    });

    thread::sleep(Duration::from_millis(100));

    // this request closes the cycle
    let err = index.store(&t2, b"k1", b"t2-wants").unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::Deadlock);

    // the victim rolls back; the survivor finishes
    t2.reset().unwrap();
    blocked.join().unwrap();
    t1.commit().unwrap();

    let check = db.bogus();
    assert_eq!(index.load(&check, b"k1").unwrap().unwrap(), b"t1");
    assert_eq!(index.load(&check, b"k2").unwrap().unwrap(), b"t1-wants");
}

#[test]
fn test_strict_upgrade_rule_rejected_under_sharing() {
    setup();
    let db = Database::open(quiet_options().lock_upgrade_rule(LockUpgradeRule::Strict)).unwrap();
    let index = db.open_index(b"upgrade").unwrap();
    {
        let txn = db.begin().unwrap();
        index.store(&txn, b"k", b"v").unwrap();
        txn.commit().unwrap();
    }

    // two pure readers share the lock
    let mut r1 = db.begin().unwrap();
    r1.set_read_lock_mode(small_store::LockMode::Shared);
    let mut r2 = db.begin().unwrap();
    r2.set_read_lock_mode(small_store::LockMode::Shared);
    index.load(&r1, b"k").unwrap();
    index.load(&r2, b"k").unwrap();

    // r1 asking for upgradable while r2 shares is illegal under STRICT
    let err = r1.lock(index.id(), b"k", small_store::LockMode::Upgradable).unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::IllegalUpgrade);

    r2.commit().unwrap();
    // alone now, the upgrade goes through
    r1.lock(index.id(), b"k", small_store::LockMode::Upgradable).unwrap();
    r1.commit().unwrap();
}

/// The standard read-modify-write shape: t1 reads a key (taking the
/// default upgradable lock), a second writer parks for exclusive on the
/// same key, then t1 writes. The upgrade must go through rather than
/// queue behind the writer it is blocking, and the writer proceeds once
/// t1 commits.
#[test]
fn test_read_then_write_upgrades_past_parked_writer() {
    let db = new_mem_db();
    let index = db.open_index(b"rmw").unwrap();
    {
        let txn = db.begin().unwrap();
        index.store(&txn, b"counter", b"0").unwrap();
        txn.commit().unwrap();
    }

    // t1 reads with the default upgradable link mode
    let t1 = db.begin().unwrap();
    assert_eq!(index.load(&t1, b"counter").unwrap().unwrap(), b"0");

    // t2 parks requesting exclusive on the same key
    let db2 = db.clone();
    let index2 = index.clone();
    let parked = thread::spawn(move || {
        let mut t2 = db2.begin().unwrap();
        t2.set_lock_timeout_nanos(-1);
        index2.store(&t2, b"counter", b"from-t2").unwrap();
        t2.commit().unwrap();
    });
    thread::sleep(Duration::from_millis(100));

    // the read-modify-write completes with no timeout and no deadlock
    index.store(&t1, b"counter", b"from-t1").unwrap();
    assert_eq!(index.load(&t1, b"counter").unwrap().unwrap(), b"from-t1");
    t1.commit().unwrap();

    // and the parked writer lands afterwards
    parked.join().unwrap();
    let check = db.bogus();
    assert_eq!(index.load(&check, b"counter").unwrap().unwrap(), b"from-t2");
}

#[test]
fn test_reads_block_behind_uncommitted_write() {
    let db = new_mem_db();
    let index = db.open_index(b"visibility").unwrap();

    let writer = db.begin().unwrap();
    index.store(&writer, b"k", b"pending").unwrap();

    // a locking reader cannot see the uncommitted value
    let mut reader = db.begin().unwrap();
    reader.set_lock_timeout_nanos(50_000_000);
    let err = index.load(&reader, b"k").unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::LockTimeout);

    writer.commit().unwrap();
    assert_eq!(index.load(&reader, b"k").unwrap().unwrap(), b"pending");
    reader.commit().unwrap();
}
