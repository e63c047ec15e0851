//! Storage faults, damaged blocks and lock timeouts surface as errors
//! without leaking locks.

use std::time::Duration;

use crate::storage::btree::Node;
use crate::storage::{
    BTreeError, BlockId, CacheConfig, CacheError, Database, DatabaseError, FaultInjector, KeyRange,
    LockMode, StorageError,
};
use crate::testing::{key, memory_database, test_cache_config};

const BLOCK: usize = 256;

fn populated(seed: u64, config: CacheConfig) -> (Database, FaultInjector) {
    let (db, faults) = memory_database(BLOCK, seed, config).unwrap();
    for i in 0..300 {
        db.insert(&key(i), b"value").unwrap();
    }
    db.flush().unwrap();
    db.cache().evict_unpinned().unwrap();
    (db, faults)
}

/// The last leaf in key order.
fn last_leaf(db: &Database) -> BlockId {
    let total = db.cache().superblock().total_blocks;
    let mut last: Option<(Vec<u8>, BlockId)> = None;
    for block_id in 1..total {
        let lock = db.cache().acquire(block_id, LockMode::Read).unwrap();
        let Ok(Node::Leaf(leaf)) = Node::parse(lock.data()) else {
            continue;
        };
        let first = leaf.first_key().unwrap().unwrap().to_vec();
        if last.as_ref().is_none_or(|(k, _)| *k < first) {
            last = Some((first, block_id));
        }
    }
    last.unwrap().1
}

#[test]
fn test_read_failure_propagates() {
    let (db, faults) = populated(51, test_cache_config(64));
    faults.fail_reads_of(db.tree().root());

    let error = db.lookup(&key(5)).unwrap_err();
    assert!(matches!(
        error,
        DatabaseError::Tree(BTreeError::Cache(CacheError::Storage(
            StorageError::InjectedFault(_)
        )))
    ));
    assert!(!error.is_corruption());
    assert!(db.iterate(KeyRange::all()).is_err());
    assert_eq!(db.cache_stats().outstanding_locks(), 0);

    faults.heal();
    assert_eq!(db.lookup(&key(5)).unwrap(), Some(b"value".to_vec()));
}

#[test]
fn test_read_failure_mid_scan() {
    let (db, faults) = populated(52, test_cache_config(64));
    let leaf = last_leaf(&db);
    db.cache().evict_unpinned().unwrap();
    faults.fail_reads_of(leaf);

    let mut cursor = db.iterate(KeyRange::all()).unwrap();
    let mut seen = 0;
    let error = loop {
        match cursor.next() {
            Some(Ok(_)) => seen += 1,
            Some(Err(e)) => break e,
            None => panic!("scan finished despite failing leaf"),
        }
    };
    assert!(seen > 0 && seen < 300);
    assert!(!error.is_corruption());

    // The cursor gave up everything it held
    assert_eq!(db.cache_stats().outstanding_locks(), 0);
    assert!(cursor.next().is_none());

    faults.heal();
    assert_eq!(db.iterate(KeyRange::all()).unwrap().count(), 300);
}

#[test]
fn test_damaged_block_is_corruption() {
    let (db, faults) = populated(53, test_cache_config(64));
    faults.corrupt_reads_of(db.tree().root());

    let error = db.lookup(&key(1)).unwrap_err();
    assert!(error.is_corruption());
    assert!(db.verify().unwrap_err().is_corruption());
    assert_eq!(db.cache_stats().outstanding_locks(), 0);
}

#[test]
fn test_lock_timeout_from_cursor_construction() {
    let config = CacheConfig {
        lock_timeout: Some(Duration::from_millis(20)),
        ..test_cache_config(64)
    };
    let (db, _) = populated(54, config);

    let held = db.cache().acquire(db.tree().root(), LockMode::Write).unwrap();
    let error = db.iterate(KeyRange::all()).unwrap_err();
    assert!(matches!(
        error,
        DatabaseError::Tree(BTreeError::Cache(CacheError::LockTimeout {
            mode: LockMode::Read,
            ..
        }))
    ));
    assert!(db.lookup(&key(0)).is_err());
    assert_eq!(db.cache_stats().outstanding_locks(), 1);

    drop(held);
    assert_eq!(db.iterate(KeyRange::all()).unwrap().count(), 300);
    assert_eq!(db.cache_stats().outstanding_locks(), 0);
}
