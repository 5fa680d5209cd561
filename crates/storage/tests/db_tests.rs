//! Integration tests for the Database wrapper and entry wire format

use meridian_storage::{Database, DbEntry, StoreError, WriteBatch};
use tempfile::TempDir;

fn open_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open_path(temp_dir.path()).unwrap();
    (db, temp_dir)
}

#[test]
fn get_put_round_trip() {
    let (db, _dir) = open_test_db();

    db.put(b"alpha", b"one").unwrap();
    assert_eq!(db.get(b"alpha").unwrap(), b"one");
    assert_eq!(db.get_opt(b"alpha").unwrap(), Some(b"one".to_vec()));

    db.delete(b"alpha").unwrap();
    assert_eq!(db.get_opt(b"alpha").unwrap(), None);
}

#[test]
fn missing_key_is_key_not_found() {
    let (db, _dir) = open_test_db();
    assert!(matches!(db.get(b"nope"), Err(StoreError::KeyNotFound)));
}

#[test]
fn write_batch_commits_atomically() {
    let (db, _dir) = open_test_db();

    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1");
    batch.put(b"b", b"2");
    batch.delete(b"a");
    assert_eq!(batch.len(), 3);
    db.write(batch).unwrap();

    assert_eq!(db.get_opt(b"a").unwrap(), None);
    assert_eq!(db.get(b"b").unwrap(), b"2");
}

#[test]
fn update_sees_its_own_writes() {
    let (db, _dir) = open_test_db();
    db.put(b"k", b"old").unwrap();

    db.update(|txn| {
        assert_eq!(txn.get(b"k")?, Some(b"old".to_vec()));
        txn.put(b"k", b"new");
        assert_eq!(txn.get(b"k")?, Some(b"new".to_vec()));
        txn.delete(b"k");
        assert_eq!(txn.get(b"k")?, None);
        txn.put(b"k", b"final");
        txn.put(b"other", b"x");
        Ok(())
    })
    .unwrap();

    assert_eq!(db.get(b"k").unwrap(), b"final");
    assert_eq!(db.get(b"other").unwrap(), b"x");
}

#[test]
fn update_error_applies_nothing() {
    let (db, _dir) = open_test_db();
    db.put(b"k", b"old").unwrap();

    let result = db.update(|txn| {
        txn.put(b"k", b"new");
        txn.put(b"extra", b"y");
        Err(StoreError::Encoding("boom".into()))
    });

    assert!(result.is_err());
    assert_eq!(db.get(b"k").unwrap(), b"old");
    assert_eq!(db.get_opt(b"extra").unwrap(), None);
}

#[test]
fn iterate_prefix_respects_bounds_and_limit() {
    let (db, _dir) = open_test_db();

    for i in 0u8..10 {
        db.put(&[0x10, i], &[i]).unwrap();
    }
    db.put(&[0x11, 0x00], b"outside").unwrap();

    // Whole prefix in one scan.
    let (entries, full) = db.iterate_prefix(&[0x10], &[], 100).unwrap();
    assert_eq!(entries.len(), 10);
    assert!(!full);
    assert!(entries.windows(2).all(|w| w[0].key < w[1].key));

    // Bounded scan reports full.
    let (entries, full) = db.iterate_prefix(&[0x10], &[], 4).unwrap();
    assert_eq!(entries.len(), 4);
    assert!(full);

    // Resume from a mid-range start key.
    let (entries, full) = db.iterate_prefix(&[0x10], &[0x10, 0x07], 100).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(!full);
    assert_eq!(entries[0].key, vec![0x10, 0x07]);

    // A start key below the prefix clamps to the prefix.
    let (entries, _) = db.iterate_prefix(&[0x10], &[0x05], 100).unwrap();
    assert_eq!(entries.len(), 10);
}

#[test]
fn drop_prefix_leaves_neighbors() {
    let (db, _dir) = open_test_db();

    for i in 0u8..50 {
        db.put(&[0x20, i], &[i]).unwrap();
    }
    db.put(&[0x21], b"keep").unwrap();

    db.drop_prefix(&[0x20]).unwrap();

    let (entries, _) = db.iterate_prefix(&[0x20], &[], 100).unwrap();
    assert!(entries.is_empty());
    assert_eq!(db.get(&[0x21]).unwrap(), b"keep");
}

#[test]
fn entry_wire_round_trip() {
    let entry = DbEntry::new(b"some-key".to_vec(), b"some-value".to_vec());
    let encoded = entry.encode();

    let (decoded, rest) = DbEntry::decode(&encoded).unwrap();
    assert_eq!(decoded, entry);
    assert!(rest.is_empty());

    // Entries concatenate cleanly.
    let second = DbEntry::new(vec![0x01], Vec::new());
    let mut stream = entry.encode();
    stream.extend_from_slice(&second.encode());
    let (first_out, rest) = DbEntry::decode(&stream).unwrap();
    let (second_out, rest) = DbEntry::decode(rest).unwrap();
    assert_eq!(first_out, entry);
    assert_eq!(second_out, second);
    assert!(rest.is_empty());
}

#[test]
fn entry_decode_rejects_truncation() {
    let entry = DbEntry::new(b"key".to_vec(), b"value".to_vec());
    let encoded = entry.encode();

    for cut in 0..encoded.len() {
        assert!(
            DbEntry::decode(&encoded[..cut]).is_err(),
            "decode succeeded on truncation at {cut}"
        );
    }
}

#[test]
fn empty_sentinel_round_trip() {
    let sentinel = DbEntry::empty();
    let (decoded, rest) = DbEntry::decode(&sentinel.encode()).unwrap();
    assert!(decoded.is_empty());
    assert!(rest.is_empty());
}
