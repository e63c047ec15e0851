//! Pairs survive closing and reopening the database file.

use crate::storage::KeyRange;
use crate::testing::{TestDatabase, key, value};

#[test]
fn test_reopen_keeps_pairs() {
    let test = TestDatabase::new(512).unwrap();
    for i in 0..1000 {
        test.database.insert(&key(i), &value(i, 1 + i as usize % 40)).unwrap();
    }
    for i in (0..1000).step_by(3) {
        assert!(test.database.remove(&key(i)).unwrap().is_some());
    }

    let test = test.reopen().unwrap();
    for i in 0..1000 {
        let expected = (i % 3 != 0).then(|| value(i, 1 + i as usize % 40));
        assert_eq!(test.database.lookup(&key(i)).unwrap(), expected);
    }

    let stats = test.database.verify().unwrap();
    assert_eq!(stats.pairs, 666);
    assert!(stats.depth >= 2);
}

#[test]
fn test_reopen_keeps_block_size_and_order() {
    let test = TestDatabase::new(256).unwrap();
    for i in (0..300).rev() {
        test.database.insert(&key(i), b"v").unwrap();
    }
    assert!(test.config.database_path.exists());

    let test = test.reopen().unwrap();
    assert_eq!(test.database.block_size(), 256);

    let keys: Vec<Vec<u8>> = test
        .database
        .iterate(KeyRange::all())
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys, (0..300).map(key).collect::<Vec<_>>());
}

#[test]
fn test_reopen_empty_database() {
    let test = TestDatabase::new(4096).unwrap();
    let test = test.reopen().unwrap();
    assert_eq!(test.database.lookup(b"anything").unwrap(), None);
    assert_eq!(test.database.verify().unwrap().nodes, 1);
}
