//! Large values go through overflow chains whose blocks are recycled.

use crate::storage::KeyRange;
use crate::storage::overflow::data_per_block;
use crate::testing::{TestDatabase, memory_database, test_cache_config, value};

const BLOCK: usize = 256;

#[test]
fn test_large_values_round_trip() {
    let (db, _) = memory_database(BLOCK, 31, test_cache_config(16)).unwrap();
    let sizes = [0usize, 1, 50, 200, 236, 237, 1000, 10_000];
    for (i, &len) in (0u32..).zip(sizes.iter()) {
        db.insert(&[b'v', b'0' + u8::try_from(i).unwrap()], &value(i, len))
            .unwrap();
    }

    for (i, &len) in (0u32..).zip(sizes.iter()) {
        let key = [b'v', b'0' + u8::try_from(i).unwrap()];
        assert_eq!(db.lookup(&key).unwrap(), Some(value(i, len)));
    }

    let values: Vec<usize> = db
        .iterate(KeyRange::all())
        .unwrap()
        .map(|entry| entry.unwrap().1.len())
        .collect();
    assert_eq!(values, sizes);
    assert!(db.verify().unwrap().overflow_values >= 4);
}

#[test]
fn test_replaced_chains_are_recycled() {
    let (db, _) = memory_database(BLOCK, 32, test_cache_config(64)).unwrap();
    let len: usize = 2000;
    let chain = len.div_ceil(data_per_block(BLOCK));

    db.insert(b"big", &value(0, len)).unwrap();
    let after_first = db.cache().superblock().total_blocks;

    for i in 1..20 {
        let previous = db.insert(b"big", &value(i, len)).unwrap();
        assert_eq!(previous, Some(value(i - 1, len)));
    }
    // One spare chain while the old value is still referenced
    assert!(db.cache().superblock().total_blocks <= after_first + chain as u64);

    db.remove(b"big").unwrap();
    assert!(db.cache().superblock().free_blocks >= chain as u64);
    assert_eq!(db.verify().unwrap().overflow_values, 0);
}

#[test]
fn test_large_values_persist() {
    let test = TestDatabase::new(BLOCK).unwrap();
    test.database.insert(b"blob", &value(9, 5000)).unwrap();
    test.database.insert(b"tiny", b"t").unwrap();

    let test = test.reopen().unwrap();
    assert_eq!(test.database.lookup(b"blob").unwrap(), Some(value(9, 5000)));
    assert_eq!(test.database.lookup(b"tiny").unwrap(), Some(b"t".to_vec()));
}
