use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use crate::test_utils::{new_file_db, setup};

const PAGE_SIZE: usize = 4096;
const OFF_SEQUENCE: usize = 16;
const OFF_PM_STATE: usize = 48;
const PM_STATE_LEN: usize = 140;

/// Read the newest header slot straight off the data file.
fn read_newest_header(base: &PathBuf) -> Vec<u8> {
    let mut name = base.file_name().unwrap().to_os_string();
    name.push(".db");
    let mut file = File::open(base.with_file_name(name)).unwrap();
    let mut pages = vec![0u8; 2 * PAGE_SIZE];
    file.read_exact(&mut pages).unwrap();

    let seq_a = u64::from_le_bytes(pages[OFF_SEQUENCE..OFF_SEQUENCE + 8].try_into().unwrap());
    let seq_b = u64::from_le_bytes(
        pages[PAGE_SIZE + OFF_SEQUENCE..PAGE_SIZE + OFF_SEQUENCE + 8]
            .try_into()
            .unwrap(),
    );
    if seq_a >= seq_b {
        pages[..PAGE_SIZE].to_vec()
    } else {
        pages[PAGE_SIZE..].to_vec()
    }
}

fn pm_state(header: &[u8]) -> &[u8] {
    &header[OFF_PM_STATE..OFF_PM_STATE + PM_STATE_LEN]
}

/// Two consecutive checkpoints with no writes in between produce
/// identical page-manager state.
#[test]
fn test_checkpoint_idempotence() {
    setup();
    let (db, base) = new_file_db("ckpt-idem");
    let index = db.open_index(b"data").unwrap();

    let txn = db.begin().unwrap();
    for i in 0..200u32 {
        index
            .store(&txn, format!("k{:04}", i).as_bytes(), &[7u8; 64])
            .unwrap();
    }
    txn.commit().unwrap();

    db.checkpoint().unwrap();
    let first = read_newest_header(&base);

    db.checkpoint().unwrap();
    let second = read_newest_header(&base);

    assert_eq!(pm_state(&first), pm_state(&second));
}

/// Every commit that returned before the checkpoint is durable after
/// the checkpoint's header write, across a plain reopen.
#[test]
fn test_checkpoint_then_reopen_sees_all_commits() {
    setup();
    let (db, base) = new_file_db("ckpt-reopen");
    let index = db.open_index(b"data").unwrap();

    for round in 0..5u32 {
        let txn = db.begin().unwrap();
        for i in 0..50u32 {
            index
                .store(
                    &txn,
                    format!("r{}k{:03}", round, i).as_bytes(),
                    format!("value-{}", round).as_bytes(),
                )
                .unwrap();
        }
        txn.commit().unwrap();
        db.checkpoint().unwrap();
    }
    db.close().unwrap();
    drop(db);

    let db = small_store::Database::open(
        crate::test_utils::quiet_options().base_file(base),
    )
    .unwrap();
    let index = db.find_index(b"data").unwrap().unwrap();
    let check = db.bogus();
    for round in 0..5u32 {
        for i in 0..50u32 {
            assert_eq!(
                index
                    .load(&check, format!("r{}k{:03}", round, i).as_bytes())
                    .unwrap()
                    .unwrap(),
                format!("value-{}", round).as_bytes()
            );
        }
    }
}

/// Pages freed by deletes become reusable after a checkpoint: steady
/// insert/delete churn with checkpoints must not grow the file without
/// bound.
#[test]
fn test_free_pages_recycle_across_checkpoints() {
    setup();
    let (db, _base) = new_file_db("ckpt-recycle");
    let index = db.open_index(b"churn").unwrap();

    let mut peak = 0;
    for round in 0..10u32 {
        let txn = db.begin().unwrap();
        for i in 0..100u32 {
            index
                .store(&txn, format!("k{:04}", i).as_bytes(), &[round as u8; 200])
                .unwrap();
        }
        txn.commit().unwrap();

        let txn = db.begin().unwrap();
        for i in 0..100u32 {
            index.delete(&txn, format!("k{:04}", i).as_bytes()).unwrap();
        }
        txn.commit().unwrap();

        db.checkpoint().unwrap();
        peak = peak.max(db.stats().total_pages);
    }

    // the file settles instead of growing round after round
    let final_pages = db.stats().total_pages;
    assert!(
        final_pages as f64 <= peak as f64 * 1.5 + 16.0,
        "file keeps growing: final {} vs peak {}",
        final_pages,
        peak
    );
}
