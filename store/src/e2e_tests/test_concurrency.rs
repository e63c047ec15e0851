//! Readers and writers on many threads keep the tree valid.

use std::collections::BTreeSet;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::KeyRange;
use crate::testing::{memory_database, test_cache_config};

const WRITERS: u32 = 4;
const KEYS_PER_WRITER: u32 = 300;

fn writer_key(writer: u32, i: u32) -> Vec<u8> {
    format!("{i:04}w{writer}").into_bytes()
}

#[test]
fn test_concurrent_readers_and_writers() {
    // A small cache so frames are evicted and reloaded under contention
    let (db, _) = memory_database(256, 61, test_cache_config(48)).unwrap();

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let db = &db;
            scope.spawn(move || {
                for i in 0..KEYS_PER_WRITER {
                    db.insert(&writer_key(writer, i), &i.to_le_bytes()).unwrap();
                }
                for i in (0..KEYS_PER_WRITER).step_by(3) {
                    assert_eq!(
                        db.remove(&writer_key(writer, i)).unwrap(),
                        Some(i.to_le_bytes().to_vec())
                    );
                }
            });
        }

        for reader in 0..2u64 {
            let db = &db;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(reader);
                for _ in 0..30 {
                    // Whatever a scan sees must come out ascending
                    let mut previous: Option<Vec<u8>> = None;
                    for entry in db.iterate(KeyRange::all()).unwrap() {
                        let (key, _) = entry.unwrap();
                        assert!(previous.as_ref().is_none_or(|p| *p < key));
                        previous = Some(key);
                    }

                    let writer = rng.random_range(0..WRITERS);
                    let i = rng.random_range(0..KEYS_PER_WRITER);
                    if let Some(value) = db.lookup(&writer_key(writer, i)).unwrap() {
                        assert_eq!(value, i.to_le_bytes());
                    }
                }
            });
        }
    });

    let expected: BTreeSet<Vec<u8>> = (0..WRITERS)
        .flat_map(|w| (0..KEYS_PER_WRITER).filter(|i| i % 3 != 0).map(move |i| writer_key(w, i)))
        .collect();
    let actual: BTreeSet<Vec<u8>> = db
        .iterate(KeyRange::all())
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(actual, expected);
    assert_eq!(db.verify().unwrap().pairs, expected.len());
    assert_eq!(db.cache_stats().outstanding_locks(), 0);
}
