//! Random inserts and removes keep the tree valid and in step with a map.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::KeyRange;
use crate::testing::{memory_database, test_cache_config};

/// Smallest block size: a handful of pairs per node, so every operation
/// splits, merges or levels often.
const BLOCK: usize = 128;

fn random_key(rng: &mut StdRng) -> Vec<u8> {
    let len = rng.random_range(0..=8);
    (0..len).map(|_| rng.random_range(b'a'..=b'h')).collect()
}

#[test]
fn test_random_workload_matches_model() {
    let (db, _) = memory_database(BLOCK, 21, test_cache_config(64)).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model = BTreeMap::new();

    for step in 0..4000 {
        let key = random_key(&mut rng);
        if rng.random_bool(0.6) {
            let value: Vec<u8> = (0..rng.random_range(0..60)).map(|_| rng.random()).collect();
            let previous = db.insert(&key, &value).unwrap();
            assert_eq!(previous, model.insert(key, value));
        } else {
            assert_eq!(db.remove(&key).unwrap(), model.remove(&key));
        }

        if step % 250 == 0 {
            assert_eq!(db.verify().unwrap().pairs, model.len());
        }
    }

    let entries: Vec<(Vec<u8>, Vec<u8>)> = db
        .iterate(KeyRange::all())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(entries, expected);
    assert_eq!(db.cache_stats().outstanding_locks(), 0);
}

#[test]
fn test_drain_shrinks_to_single_leaf() {
    let (db, _) = memory_database(BLOCK, 22, test_cache_config(64)).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut keys: Vec<u32> = (0..800).collect();

    for &i in &keys {
        db.insert(format!("{i:05}").as_bytes(), b"value").unwrap();
    }
    let grown = db.verify().unwrap();
    assert!(grown.depth >= 3);

    // Remove in random order
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.random_range(0..=i));
    }
    for (removed, &i) in keys.iter().enumerate() {
        assert_eq!(
            db.remove(format!("{i:05}").as_bytes()).unwrap(),
            Some(b"value".to_vec())
        );
        if removed % 100 == 0 {
            assert_eq!(db.verify().unwrap().pairs, keys.len() - removed - 1);
        }
    }

    let stats = db.verify().unwrap();
    assert_eq!((stats.depth, stats.nodes, stats.pairs), (1, 1, 0));
}

#[test]
fn test_root_block_never_moves() {
    let (db, _) = memory_database(BLOCK, 23, test_cache_config(64)).unwrap();
    let root = db.tree().root();
    for i in 0..300u32 {
        db.insert(&i.to_be_bytes(), &[0u8; 20]).unwrap();
    }
    for i in 0..300u32 {
        db.remove(&i.to_be_bytes()).unwrap();
    }
    assert_eq!(db.tree().root(), root);
    assert_eq!(db.cache().superblock().root_block, root);
}
