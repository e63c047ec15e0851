//! High-level database interface.
//!
//! A [`Database`] owns the buffer cache and the tree. Every mutation runs
//! in its own write transaction and is flushed before the call returns.

use std::sync::Arc;

use tracing::info;

use crate::config::{ConfigError, StoreConfig};
use crate::storage::btree::{BTree, BTreeError, Cursor, KeyRange, TreeStats};
use crate::storage::cache::{BufferCache, CacheConfig, CacheError, CacheStats};
use crate::storage::file::{DatabaseFile, FileError};
use crate::storage::io::Storage;
use crate::storage::transaction::Transactor;

/// A key-value database.
///
/// Safe to share between threads. Readers run concurrently with each other
/// and with writers on other parts of the tree.
#[derive(Debug)]
pub struct Database {
    cache: Arc<BufferCache>,
    tree: BTree,
}

impl Database {
    /// Create a new database file.
    ///
    /// The path must not already exist.
    pub fn create(config: &StoreConfig) -> Result<Self, DatabaseError> {
        config.validate()?;
        let file = DatabaseFile::create(&config.database_path, config.block_size)?;
        info!(path = %config.database_path.display(), "creating database");
        Self::create_with_storage(Box::new(file), config.cache_config())
    }

    /// Open an existing database file.
    pub fn open(config: &StoreConfig) -> Result<Self, DatabaseError> {
        config.validate()?;
        let file = DatabaseFile::open(&config.database_path)?;
        info!(path = %config.database_path.display(), "opening database");
        Self::open_with_storage(Box::new(file), config.cache_config())
    }

    /// Open the database file, creating it (and its directory) if missing.
    pub fn open_or_create(config: &StoreConfig) -> Result<Self, DatabaseError> {
        if config.database_path.exists() {
            return Self::open(config);
        }
        if let Some(parent) = config.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::create(config)
    }

    /// Initialise a database on empty storage.
    pub fn create_with_storage(
        storage: Box<dyn Storage>,
        config: CacheConfig,
    ) -> Result<Self, DatabaseError> {
        let cache = BufferCache::create(storage, config)?;
        let txn = Transactor::begin_write(&cache);
        let tree = BTree::create(&txn)?;
        cache.set_root_block(tree.root());
        txn.commit()?;
        Ok(Self { cache, tree })
    }

    /// Open a database on storage that already holds one.
    pub fn open_with_storage(
        storage: Box<dyn Storage>,
        config: CacheConfig,
    ) -> Result<Self, DatabaseError> {
        let cache = BufferCache::open(storage, config)?;
        let root = cache.superblock().root_block;
        if root == 0 {
            return Err(DatabaseError::MissingRoot);
        }
        Ok(Self {
            cache,
            tree: BTree::open(root),
        })
    }

    /// The value stored under `key`.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let txn = Transactor::begin_read(&self.cache);
        Ok(self.tree.lookup(&txn, key)?)
    }

    /// Store `value` under `key`. Returns the previous value.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let txn = Transactor::begin_write(&self.cache);
        let previous = self.tree.insert(&txn, key, value)?;
        txn.commit()?;
        Ok(previous)
    }

    /// Remove `key`. Returns the removed value.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let txn = Transactor::begin_write(&self.cache);
        let removed = self.tree.remove(&txn, key)?;
        txn.commit()?;
        Ok(removed)
    }

    /// Iterate over the pairs in `range`, in key order.
    ///
    /// The cursor holds read locks until it is dropped. Do not write from
    /// the same thread while it is open.
    pub fn iterate(&self, range: KeyRange) -> Result<Cursor, DatabaseError> {
        let txn = Transactor::begin_read(&self.cache);
        Ok(self.tree.iterate(&txn, range)?)
    }

    /// Write every dirty block and the superblock to storage.
    pub fn flush(&self) -> Result<(), DatabaseError> {
        Ok(self.cache.flush()?)
    }

    /// Check the structure of the whole tree.
    pub fn verify(&self) -> Result<TreeStats, DatabaseError> {
        let txn = Transactor::begin_read(&self.cache);
        Ok(self.tree.verify(&txn)?)
    }

    /// Buffer cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Block size of the underlying storage.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    /// The buffer cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    /// The tree.
    #[must_use]
    pub const fn tree(&self) -> BTree {
        self.tree
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(error) = self.cache.flush() {
            tracing::warn!(%error, "failed to flush database on close");
        }
    }
}

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// File error.
    #[error("file error: {0}")]
    File(#[from] FileError),
    /// I/O error outside the database file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Buffer cache error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    /// Tree error.
    #[error("tree error: {0}")]
    Tree(#[from] BTreeError),
    /// The superblock names no root block.
    #[error("superblock has no root block")]
    MissingRoot,
}

impl DatabaseError {
    /// Whether this error reports damaged data.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        match self {
            Self::Cache(e) => e.is_corruption(),
            Self::Tree(e) => e.is_corruption(),
            Self::MissingRoot => true,
            Self::Config(_) | Self::File(_) | Self::Io(_) => false,
        }
    }
}
