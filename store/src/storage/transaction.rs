//! Transaction context threaded through every block access.
//!
//! A [`Transactor`] carries a transaction id and access mode on top of the
//! buffer cache. Tree operations take one and route all lock, allocate and
//! free calls through it.
//!
//! There is no rollback: a write transaction's changes land in the cache as
//! they are made. Committing flushes the cache to storage.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::storage::cache::{BlockLock, BufferCache, CacheError, LockMode};
use crate::storage::page::BlockId;

/// A transaction identifier.
pub type TxnId = u64;

/// A transaction over a buffer cache.
pub struct Transactor {
    cache: Arc<BufferCache>,
    txn_id: TxnId,
    mode: LockMode,
    committed: bool,
}

impl Transactor {
    /// Begin a read-only transaction.
    #[must_use]
    pub fn begin_read(cache: &Arc<BufferCache>) -> Self {
        Self::begin(cache, LockMode::Read)
    }

    /// Begin a read-write transaction.
    #[must_use]
    pub fn begin_write(cache: &Arc<BufferCache>) -> Self {
        Self::begin(cache, LockMode::Write)
    }

    fn begin(cache: &Arc<BufferCache>, mode: LockMode) -> Self {
        let txn_id = cache.assign_txn_id();
        debug!(txn_id, ?mode, "begin transaction");
        Self {
            cache: Arc::clone(cache),
            txn_id,
            mode,
            committed: false,
        }
    }

    /// A read-only view of this transaction, for iterators that outlive a borrow.
    #[must_use]
    pub fn reader(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            txn_id: self.txn_id,
            mode: LockMode::Read,
            committed: false,
        }
    }

    /// Get the transaction ID.
    #[must_use]
    pub const fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Whether write locks are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.mode == LockMode::Read
    }

    /// The underlying cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    /// Block size of the database.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    /// Lock a block.
    pub fn acquire(&self, block_id: BlockId, mode: LockMode) -> Result<BlockLock, CacheError> {
        if mode == LockMode::Write {
            self.check_writable()?;
        }
        self.cache.acquire(block_id, mode)
    }

    /// Allocate a zeroed block, write-locked.
    pub fn allocate_block(&self) -> Result<BlockLock, CacheError> {
        self.check_writable()?;
        self.cache.allocate_block()
    }

    /// Free a write-locked block.
    pub fn free_block(&self, lock: BlockLock) -> Result<(), CacheError> {
        self.check_writable()?;
        self.cache.free_block(lock)
    }

    /// Hint that a block will be read soon.
    pub fn prefetch(&self, block_id: BlockId) {
        self.cache.prefetch(block_id);
    }

    /// Finish the transaction. Write transactions flush the cache.
    pub fn commit(mut self) -> Result<(), CacheError> {
        // Marked first so a failed flush does not also warn on drop
        self.committed = true;
        if self.mode == LockMode::Write {
            self.cache.flush()?;
        }
        debug!(txn_id = self.txn_id, "commit transaction");
        Ok(())
    }

    const fn check_writable(&self) -> Result<(), CacheError> {
        match self.mode {
            LockMode::Write => Ok(()),
            LockMode::Read => Err(CacheError::ReadOnly),
        }
    }
}

impl Drop for Transactor {
    fn drop(&mut self) {
        if !self.committed && self.mode == LockMode::Write {
            warn!(
                txn_id = self.txn_id,
                "write transaction dropped without commit; changes remain unflushed"
            );
        }
    }
}

impl std::fmt::Debug for Transactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactor")
            .field("txn_id", &self.txn_id)
            .field("mode", &self.mode)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::CacheConfig;
    use crate::storage::memory::MemoryStorage;

    fn new_cache() -> Arc<BufferCache> {
        let config = CacheConfig {
            capacity: 16,
            lock_timeout: None,
            prefetch: false,
        };
        BufferCache::create(Box::new(MemoryStorage::new(128, 1)), config).expect("create cache")
    }

    #[test]
    fn test_transaction_ids_increase() {
        let cache = new_cache();
        let t1 = Transactor::begin_read(&cache);
        let t2 = Transactor::begin_write(&cache);
        assert!(t2.txn_id() > t1.txn_id());
        t2.commit().expect("commit");
    }

    #[test]
    fn test_read_transaction_refuses_writes() {
        let cache = new_cache();
        let writer = Transactor::begin_write(&cache);
        let block = writer.allocate_block().expect("allocate").block_id();
        writer.commit().expect("commit");

        let reader = Transactor::begin_read(&cache);
        assert!(matches!(
            reader.acquire(block, LockMode::Write),
            Err(CacheError::ReadOnly)
        ));
        assert!(matches!(reader.allocate_block(), Err(CacheError::ReadOnly)));
        assert!(reader.acquire(block, LockMode::Read).is_ok());
    }

    #[test]
    fn test_reader_view_shares_id() {
        let cache = new_cache();
        let writer = Transactor::begin_write(&cache);
        let reader = writer.reader();
        assert_eq!(reader.txn_id(), writer.txn_id());
        assert!(reader.is_read_only());
        assert!(!writer.is_read_only());
        writer.commit().expect("commit");
    }

    #[test]
    fn test_commit_flushes_dirty_blocks() {
        let cache = new_cache();
        let writer = Transactor::begin_write(&cache);
        drop(writer.allocate_block().expect("allocate"));
        writer.commit().expect("commit");
        assert_eq!(cache.stats().writebacks, 1);
    }
}
