use std::thread;

use log::debug;
use rand::Rng;

use crate::test_utils::new_mem_db;

/// Many threads inserting disjoint key ranges concurrently; the tree
/// stays consistent and every committed row is readable.
#[test]
fn test_concurrent_inserts() {
    let db = new_mem_db();
    let index = db.open_index(b"concurrent").unwrap();

    let threads = 8;
    let per_thread = 200u32;

    let mut handles = Vec::new();
    for t in 0..threads {
        let db = db.clone();
        let index = index.clone();
        handles.push(thread::spawn(move || {
            for i in 0..per_thread {
                let txn = db.begin().unwrap();
                let key = format!("t{}-k{:05}", t, i);
                let value = format!("value-{}-{}", t, i);
                index.store(&txn, key.as_bytes(), value.as_bytes()).unwrap();
                txn.commit().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(index.count().unwrap(), threads as u64 * per_thread as u64);
    let check = db.bogus();
    for t in 0..threads {
        for i in (0..per_thread).step_by(41) {
            let key = format!("t{}-k{:05}", t, i);
            assert_eq!(
                index.load(&check, key.as_bytes()).unwrap().unwrap(),
                format!("value-{}-{}", t, i).as_bytes()
            );
        }
    }
    db.verify().unwrap();
}

/// Inserters feed committed rows through a channel to deleters: heavy
/// mixed churn that leans on fine-grained locking.
#[test]
fn test_concurrent_insert_delete_churn() {
    let db = new_mem_db();
    let index = db.open_index(b"churn").unwrap();

    let (sender, receiver) = crossbeam::channel::unbounded::<Vec<u8>>();
    let rows = 400u32;

    let inserter = {
        let db = db.clone();
        let index = index.clone();
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for i in 0..rows {
                let txn = db.begin().unwrap();
                let key = format!("row-{:06}-{:04}", rng.gen_range(0, 1_000_000u32), i);
                index.store(&txn, key.as_bytes(), b"payload").unwrap();
                txn.commit().unwrap();
                sender.send(key.into_bytes()).unwrap();
            }
        })
    };

    let deleter = {
        let db = db.clone();
        let index = index.clone();
        thread::spawn(move || {
            let mut deleted = 0;
            for key in receiver.iter() {
                let txn = db.begin().unwrap();
                index.delete(&txn, &key).unwrap();
                txn.commit().unwrap();
                deleted += 1;
            }
            debug!("deleter finished, {} rows", deleted);
            deleted
        })
    };

    inserter.join().unwrap();
    let deleted: u32 = deleter.join().unwrap();
    assert_eq!(deleted, rows);
    assert_eq!(index.count().unwrap(), 0);
    db.verify().unwrap();
}

/// Point reads and writes on a hot key set: the lock manager serialises
/// them so that every read observes a fully committed value.
#[test]
fn test_concurrent_readers_see_committed_values_only() {
    let db = new_mem_db();
    let index = db.open_index(b"hot").unwrap();

    // values are always written as 8 copies of one byte; a reader must
    // never observe a torn mix
    {
        let txn = db.begin().unwrap();
        index.store(&txn, b"hot", &[0u8; 8]).unwrap();
        txn.commit().unwrap();
    }

    let writer = {
        let db = db.clone();
        let index = index.clone();
        thread::spawn(move || {
            for round in 1..=100u8 {
                let mut txn = db.begin().unwrap();
                txn.set_lock_timeout_nanos(-1);
                index.store(&txn, b"hot", &[round; 8]).unwrap();
                txn.commit().unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            let index = index.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut txn = db.begin().unwrap();
                    txn.set_lock_timeout_nanos(-1);
                    txn.set_read_lock_mode(small_store::LockMode::Shared);
                    let value = index.load(&txn, b"hot").unwrap().unwrap();
                    assert_eq!(value.len(), 8);
                    assert!(value.iter().all(|b| *b == value[0]), "torn read: {:?}", value);
                    txn.commit().unwrap();
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}
