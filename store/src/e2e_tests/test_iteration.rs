//! Range iteration through the facade.

use std::collections::BTreeMap;

use crate::storage::KeyRange;
use crate::testing::{key, memory_database, test_cache_config};

#[test]
fn test_closed_open_scenario() {
    let (db, _) = memory_database(128, 41, test_cache_config(32)).unwrap();
    for k in [b"g", b"a", b"e", b"c"] {
        db.insert(k, b"x").unwrap();
    }

    let keys: Vec<Vec<u8>> = db
        .iterate(KeyRange::new(b"c", b"g", false, true))
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys, vec![b"c".to_vec(), b"e".to_vec()]);
}

#[test]
fn test_all_bound_combinations() {
    let (db, _) = memory_database(256, 42, test_cache_config(32)).unwrap();
    let mut model = BTreeMap::new();
    for i in (0..500).step_by(2) {
        db.insert(&key(i), &i.to_le_bytes()).unwrap();
        model.insert(key(i), i.to_le_bytes().to_vec());
    }

    // Bounds both on and between present keys
    let bounds = [0, 1, 2, 99, 100, 250, 497, 498, 499, 600];
    for &start in &bounds {
        for &end in &bounds {
            for left_open in [false, true] {
                for right_open in [false, true] {
                    let range = KeyRange::new(&key(start), &key(end), left_open, right_open);
                    let expected: Vec<(Vec<u8>, Vec<u8>)> = model
                        .iter()
                        .filter(|(k, _)| range.contains(k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    let actual: Vec<(Vec<u8>, Vec<u8>)> = db
                        .iterate(range)
                        .unwrap()
                        .collect::<Result<_, _>>()
                        .unwrap();
                    assert_eq!(actual, expected, "start={start} end={end}");
                }
            }
        }
    }
    assert_eq!(db.cache_stats().outstanding_locks(), 0);
}

#[test]
fn test_cursor_drop_releases_locks() {
    let (db, _) = memory_database(128, 43, test_cache_config(256)).unwrap();
    for i in 0..400 {
        db.insert(&key(i), b"v").unwrap();
    }

    let mut cursor = db.iterate(KeyRange::all()).unwrap();
    for _ in 0..123 {
        cursor.next().unwrap().unwrap();
    }
    cursor.prefetch();
    assert!(db.cache_stats().outstanding_locks() > 1);
    drop(cursor);
    assert_eq!(db.cache_stats().outstanding_locks(), 0);

    // A writer can proceed once the cursor is gone
    db.insert(&key(1000), b"after").unwrap();
    assert_eq!(db.lookup(&key(1000)).unwrap(), Some(b"after".to_vec()));
}

#[test]
fn test_exhausted_cursor_holds_no_locks() {
    let (db, _) = memory_database(128, 44, test_cache_config(256)).unwrap();
    for i in 0..100 {
        db.insert(&key(i), b"v").unwrap();
    }
    let mut cursor = db.iterate(KeyRange::new(&key(10), &key(20), false, false)).unwrap();
    assert_eq!(cursor.by_ref().count(), 11);
    assert!(cursor.next().is_none());
    assert_eq!(db.cache_stats().outstanding_locks(), 0);
}
