use small_store::CursorValue;

use crate::test_utils::new_mem_db;

/// Insert "a".."z", position at "m", and walk forward until past "t":
/// exactly {"m".."t"} in order.
#[test]
fn test_range_scan() {
    let db = new_mem_db();
    let index = db.open_index(b"range").unwrap();

    let txn = db.begin().unwrap();
    for c in b'a'..=b'z' {
        index.store(&txn, &[c], &[c, c]).unwrap();
    }
    txn.commit().unwrap();

    let reader = db.bogus();
    let mut cursor = index.cursor(&reader);
    cursor.find_ge(b"m").unwrap();

    let mut seen = Vec::new();
    while let Some(key) = cursor.key().map(|k| k.to_vec()) {
        if key.as_slice() > b"t".as_slice() {
            break;
        }
        match cursor.value() {
            CursorValue::Value(v) => assert_eq!(v, &vec![key[0], key[0]]),
            other => panic!("unexpected value state: {:?}", other),
        }
        seen.push(key[0]);
        cursor.next().unwrap();
    }

    let expect: Vec<u8> = (b'm'..=b't').collect();
    assert_eq!(seen, expect);
}

#[test]
fn test_first_last_and_reverse_walk() {
    let db = new_mem_db();
    let index = db.open_index(b"walk").unwrap();

    let txn = db.begin().unwrap();
    for i in 0..100u32 {
        index
            .store(&txn, format!("k{:04}", i).as_bytes(), b"v")
            .unwrap();
    }
    txn.commit().unwrap();

    let reader = db.bogus();
    let mut cursor = index.cursor(&reader);

    cursor.first().unwrap();
    assert_eq!(cursor.key().unwrap(), b"k0000");
    cursor.last().unwrap();
    assert_eq!(cursor.key().unwrap(), b"k0099");

    // walk the whole index backwards
    let mut count = 0;
    while cursor.key().is_some() {
        count += 1;
        cursor.previous().unwrap();
    }
    assert_eq!(count, 100);
}

#[test]
fn test_skip_locks_only_final_entry() {
    let db = new_mem_db();
    let index = db.open_index(b"skip").unwrap();

    let txn = db.begin().unwrap();
    for i in 0..50u32 {
        index
            .store(&txn, format!("k{:04}", i).as_bytes(), b"v")
            .unwrap();
    }
    txn.commit().unwrap();

    let reader = db.begin().unwrap();
    let mut cursor = index.cursor(&reader);
    cursor.first().unwrap();
    cursor.skip(10).unwrap();
    assert_eq!(cursor.key().unwrap(), b"k0010");
    cursor.skip(-5).unwrap();
    assert_eq!(cursor.key().unwrap(), b"k0005");
    reader.commit().unwrap();
}

#[test]
fn test_find_nearby_within_leaf() {
    let db = new_mem_db();
    let index = db.open_index(b"nearby").unwrap();

    let txn = db.begin().unwrap();
    for i in 0..20u32 {
        index
            .store(&txn, format!("k{:04}", i).as_bytes(), b"v")
            .unwrap();
    }
    txn.commit().unwrap();

    let reader = db.bogus();
    let mut cursor = index.cursor(&reader);
    cursor.find(b"k0003").unwrap();
    assert!(matches!(cursor.value(), CursorValue::Value(_)));

    cursor.find_nearby(b"k0007").unwrap();
    assert_eq!(cursor.key().unwrap(), b"k0007");
    assert!(matches!(cursor.value(), CursorValue::Value(_)));
}

#[test]
fn test_unpositioned_cursor_errors() {
    let db = new_mem_db();
    let index = db.open_index(b"unpos").unwrap();
    let reader = db.bogus();
    let mut cursor = index.cursor(&reader);

    let err = cursor.next().unwrap_err();
    assert_eq!(err.get_kind(), small_store::ErrorKind::UnpositionedCursor);
    let err = cursor.load().unwrap_err();
    assert_eq!(err.get_kind(), small_store::ErrorKind::UnpositionedCursor);
    let err = cursor.skip(3).unwrap_err();
    assert_eq!(err.get_kind(), small_store::ErrorKind::UnpositionedCursor);
}

#[test]
fn test_find_on_missing_key_positions_without_value() {
    let db = new_mem_db();
    let index = db.open_index(b"missing").unwrap();

    let txn = db.begin().unwrap();
    index.store(&txn, b"b", b"v").unwrap();
    txn.commit().unwrap();

    let reader = db.bogus();
    let mut cursor = index.cursor(&reader);
    cursor.find(b"a").unwrap();
    assert_eq!(cursor.key().unwrap(), b"a");
    assert_eq!(cursor.value(), &CursorValue::Absent);

    // next from the virtual position lands on the real entry
    cursor.next().unwrap();
    assert_eq!(cursor.key().unwrap(), b"b");
}
