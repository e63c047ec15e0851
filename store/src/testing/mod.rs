//! Shared helpers for tests.

use tempfile::TempDir;

use crate::config::StoreConfig;
use crate::storage::{CacheConfig, Database, DatabaseError, FaultInjector, MemoryStorage};

/// A database file in a temporary directory, removed on drop.
pub struct TestDatabase {
    pub database: Database,
    pub config: StoreConfig,
    dir: TempDir,
}

impl TestDatabase {
    /// Create a fresh database with `block_size` blocks and a small cache.
    pub fn new(block_size: usize) -> Result<Self, DatabaseError> {
        let dir = tempfile::tempdir()?;
        let config = StoreConfig::new(dir.path().join("test.db"))
            .with_block_size(block_size)
            .with_cache_blocks(32)
            .with_prefetch(false);
        let database = Database::create(&config)?;
        Ok(Self {
            database,
            config,
            dir,
        })
    }

    /// Close the database and open it again from disk.
    pub fn reopen(self) -> Result<Self, DatabaseError> {
        let Self { database, config, dir } = self;
        drop(database);
        let database = Database::open(&config)?;
        Ok(Self {
            database,
            config,
            dir,
        })
    }
}

/// A database on in-memory storage, and the handle steering its faults.
pub fn memory_database(
    block_size: usize,
    seed: u64,
    config: CacheConfig,
) -> Result<(Database, FaultInjector), DatabaseError> {
    let storage = MemoryStorage::new(block_size, seed);
    let faults = storage.fault_injector();
    let database = Database::create_with_storage(Box::new(storage), config)?;
    Ok((database, faults))
}

/// Cache settings for tests: no prefetch thread, no lock timeout.
#[must_use]
pub const fn test_cache_config(capacity: usize) -> CacheConfig {
    CacheConfig {
        capacity,
        lock_timeout: None,
        prefetch: false,
    }
}

/// Fixed-width key so byte order matches numeric order.
#[must_use]
pub fn key(i: u32) -> Vec<u8> {
    format!("key{i:06}").into_bytes()
}

/// A value derived from its key number, `len` bytes long.
#[must_use]
pub fn value(i: u32, len: usize) -> Vec<u8> {
    i.to_le_bytes().iter().copied().cycle().take(len).collect()
}
