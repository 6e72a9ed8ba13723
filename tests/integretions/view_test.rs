use small_store::{ErrorKind, PrefixView, ReverseView};

use crate::test_utils::new_mem_db;

#[test]
fn test_reverse_view_walks_backwards() {
    let db = new_mem_db();
    let index = db.open_index(b"rev").unwrap();

    let txn = db.begin().unwrap();
    for c in b'a'..=b'e' {
        index.store(&txn, &[c], &[c]).unwrap();
    }
    txn.commit().unwrap();

    let view = ReverseView::new(index);
    let reader = db.bogus();
    let mut cursor = view.cursor(&reader);
    cursor.first().unwrap();

    let mut seen = Vec::new();
    while let Some(key) = cursor.key().map(|k| k.to_vec()) {
        seen.push(key[0]);
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec![b'e', b'd', b'c', b'b', b'a']);
}

#[test]
fn test_prefix_view_bounds_iteration() {
    let db = new_mem_db();
    let index = db.open_index(b"pfx").unwrap();

    let txn = db.begin().unwrap();
    index.store(&txn, b"apple", b"1").unwrap();
    index.store(&txn, b"apricot", b"2").unwrap();
    index.store(&txn, b"banana", b"3").unwrap();
    index.store(&txn, b"aardvark", b"4").unwrap();
    txn.commit().unwrap();

    let view = PrefixView::new(index, b"ap");
    let reader = db.bogus();
    let mut cursor = view.cursor(&reader);
    cursor.first().unwrap();

    let mut seen = Vec::new();
    while let Some(key) = cursor.key().map(|k| k.to_vec()) {
        seen.push(key);
        cursor.next().unwrap();
    }
    assert_eq!(seen, vec![b"apple".to_vec(), b"apricot".to_vec()]);
}

#[test]
fn test_prefix_view_rejects_outside_stores() {
    let db = new_mem_db();
    let index = db.open_index(b"pfx-reject").unwrap();
    let view = PrefixView::new(index, b"user:");

    let txn = db.begin().unwrap();
    view.store(&txn, b"user:42", b"ok").unwrap();
    let err = view.store(&txn, b"admin:1", b"nope").unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::ViewConstraint);
    let err = view.load(&txn, b"admin:1").unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::ViewConstraint);
    txn.commit().unwrap();

    let check = db.bogus();
    assert_eq!(view.load(&check, b"user:42").unwrap().unwrap(), b"ok");
}
