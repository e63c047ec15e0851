//! Buffer cache with scoped block locks.
//!
//! The cache owns the storage device and keeps recently used blocks in
//! memory frames. Every access to a block goes through a [`BlockLock`], a
//! read or write guard on the frame that is released when dropped.
//!
//! # Design
//!
//! - Frames are `Arc<RwLock<Page>>`; guards are the owned `arc_lock` guards of
//!   `parking_lot`, so a lock can outlive the borrow of the cache that made it
//!   (iterators keep them in their traversal stacks).
//! - Block 0 holds the superblock. It is read once on open and written on
//!   every flush; it is never served as a frame.
//! - Freed blocks form a singly linked free list (`next_free` at offset 8)
//!   whose head lives in the superblock. Allocation pops the free list before
//!   growing the device.
//! - An optional prefetch thread loads hinted blocks in the background. It
//!   never takes block locks on behalf of callers.
//!
//! # Invariants
//!
//! - Lock order: superblock mutex, then frames mutex, then storage mutex.
//! - The frames mutex is never held while blocking on a frame `RwLock`.
//! - A frame is pinned while any clone of its `Arc` exists outside the map.
//!   Only unpinned frames are evicted; capacity is therefore a soft limit.
//! - Blocks are sealed (checksummed) when written back and verified when
//!   loaded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::{debug, info, trace, warn};

use crate::storage::io::{Storage, StorageError};
use crate::storage::page::{
    BlockHeader, BlockId, BlockType, Page, PageError, SUPERBLOCK_ID, read_u64, write_u64,
};
use crate::storage::superblock::{Superblock, SuperblockError};

/// Default number of frames kept in memory.
pub const DEFAULT_CACHE_BLOCKS: usize = 4096;

/// Offset of the next-free pointer in a free block.
const NEXT_FREE_OFFSET: usize = BlockHeader::SIZE;

/// Buffer cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Soft limit on resident frames.
    pub capacity: usize,
    /// Give up on a block lock after this long. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Run the background prefetch thread.
    pub prefetch: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_BLOCKS,
            lock_timeout: None,
            prefetch: true,
        }
    }
}

/// Requested access to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Accesses served from a resident frame.
    pub hits: u64,
    /// Accesses that had to load the block.
    pub misses: u64,
    /// Frames dropped to honor the capacity.
    pub evictions: u64,
    /// Blocks loaded by the prefetch thread.
    pub prefetches: u64,
    /// Dirty frames written to storage.
    pub writebacks: u64,
    /// Block locks handed out.
    pub locks_acquired: u64,
    /// Block locks dropped.
    pub locks_released: u64,
}

impl CacheStats {
    /// Locks handed out and not yet dropped.
    #[must_use]
    pub const fn outstanding_locks(&self) -> u64 {
        self.locks_acquired - self.locks_released
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    prefetches: AtomicU64,
    writebacks: AtomicU64,
    locks_acquired: AtomicU64,
    locks_released: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
        }
    }
}

/// A resident block.
#[derive(Clone)]
struct Frame {
    data: Arc<RwLock<Page>>,
    dirty: Arc<AtomicBool>,
}

struct FrameEntry {
    frame: Frame,
    last_used: u64,
}

#[derive(Default)]
struct FrameTable {
    entries: HashMap<BlockId, FrameEntry>,
    tick: u64,
}

impl FrameTable {
    fn touch(&mut self, block_id: BlockId) -> Option<Frame> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&block_id).map(|entry| {
            entry.last_used = tick;
            entry.frame.clone()
        })
    }

    fn install(&mut self, block_id: BlockId, page: Page, dirty: bool) -> Frame {
        self.tick += 1;
        let frame = Frame {
            data: Arc::new(RwLock::new(page)),
            dirty: Arc::new(AtomicBool::new(dirty)),
        };
        self.entries.insert(
            block_id,
            FrameEntry {
                frame: frame.clone(),
                last_used: self.tick,
            },
        );
        frame
    }
}

enum Guard {
    Read(ArcRwLockReadGuard<RawRwLock, Page>),
    Write(ArcRwLockWriteGuard<RawRwLock, Page>),
}

/// A scoped lock on one cached block.
///
/// Dropping the lock releases it. Mutable access through a write lock marks
/// the frame dirty so it is written back on eviction or flush.
pub struct BlockLock {
    block_id: BlockId,
    guard: Guard,
    dirty: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl BlockLock {
    /// The locked block.
    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The mode this lock was taken in.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        match self.guard {
            Guard::Read(_) => LockMode::Read,
            Guard::Write(_) => LockMode::Write,
        }
    }

    /// Raw block contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.guard {
            Guard::Read(guard) => guard.as_bytes(),
            Guard::Write(guard) => guard.as_bytes(),
        }
    }

    /// Mutable block contents. Fails for read locks.
    pub fn data_mut(&mut self) -> Result<&mut [u8], CacheError> {
        match &mut self.guard {
            Guard::Read(_) => Err(CacheError::NotWriteLocked(self.block_id)),
            Guard::Write(guard) => {
                self.dirty.store(true, Ordering::Release);
                Ok(guard.as_bytes_mut())
            }
        }
    }
}

impl Drop for BlockLock {
    fn drop(&mut self) {
        self.counters.locks_released.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for BlockLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockLock")
            .field("block_id", &self.block_id)
            .field("mode", &self.mode())
            .finish()
    }
}

/// The buffer cache.
pub struct BufferCache {
    storage: Mutex<Box<dyn Storage>>,
    frames: Mutex<FrameTable>,
    superblock: Mutex<Superblock>,
    block_size: usize,
    config: CacheConfig,
    counters: Arc<Counters>,
    prefetcher: Option<Mutex<mpsc::Sender<BlockId>>>,
}

impl BufferCache {
    /// Open the database on `storage`, initialising it if the device is empty.
    pub fn new(storage: Box<dyn Storage>, config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        if storage.total_blocks() == 0 {
            Self::create(storage, config)
        } else {
            Self::open(storage, config)
        }
    }

    /// Initialise an empty device with a fresh superblock.
    ///
    /// # Pre-conditions
    /// - `storage` has no blocks
    pub fn create(
        mut storage: Box<dyn Storage>,
        config: CacheConfig,
    ) -> Result<Arc<Self>, CacheError> {
        if storage.total_blocks() != 0 {
            return Err(CacheError::NotEmpty);
        }
        let block_size = storage.block_size();
        crate::storage::superblock::check_block_size(block_size)?;

        storage.extend(1)?;
        let superblock = Superblock::new(block_size);
        storage.write_block(SUPERBLOCK_ID, superblock.to_page().as_bytes())?;
        storage.sync()?;
        info!(block_size, "created database");

        Ok(Self::build(storage, superblock, config))
    }

    /// Open a device that already holds a database.
    pub fn open(mut storage: Box<dyn Storage>, config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        let block_size = storage.block_size();
        let mut page = Page::new(block_size);
        storage.read_block(SUPERBLOCK_ID, page.as_bytes_mut())?;
        let mut superblock = Superblock::from_page(&page)?;

        let device_blocks = storage.total_blocks();
        if superblock.total_blocks > device_blocks {
            return Err(CacheError::Storage(StorageError::Corruption(format!(
                "superblock records {} blocks but device has {device_blocks}",
                superblock.total_blocks
            ))));
        }
        // Blocks past the recorded end were never flushed and are unreachable
        superblock.total_blocks = device_blocks;
        info!(
            block_size,
            total_blocks = device_blocks,
            free_blocks = superblock.free_blocks,
            "opened database"
        );

        Ok(Self::build(storage, superblock, config))
    }

    fn build(storage: Box<dyn Storage>, superblock: Superblock, config: CacheConfig) -> Arc<Self> {
        let block_size = storage.block_size();
        Arc::new_cyclic(|weak| {
            let prefetcher = if config.prefetch {
                spawn_prefetcher(weak.clone()).map(Mutex::new)
            } else {
                None
            };
            Self {
                storage: Mutex::new(storage),
                frames: Mutex::new(FrameTable::default()),
                superblock: Mutex::new(superblock),
                block_size,
                config,
                counters: Arc::new(Counters::default()),
                prefetcher,
            }
        })
    }

    /// Size of every block in bytes.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Snapshot of the statistics counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Copy of the in-memory superblock.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        *self.superblock.lock()
    }

    /// Hand out the next transaction id.
    pub fn assign_txn_id(&self) -> u64 {
        let mut superblock = self.superblock.lock();
        let txn_id = superblock.next_txn_id;
        superblock.next_txn_id += 1;
        txn_id
    }

    /// Record the block that holds the tree root.
    pub fn set_root_block(&self, block_id: BlockId) {
        self.superblock.lock().root_block = block_id;
    }

    /// Number of resident frames.
    #[must_use]
    pub fn resident_blocks(&self) -> usize {
        self.frames.lock().entries.len()
    }

    /// Whether `block_id` currently has a frame.
    #[must_use]
    pub fn is_resident(&self, block_id: BlockId) -> bool {
        self.frames.lock().entries.contains_key(&block_id)
    }

    /// Lock a block, loading it if it is not resident.
    ///
    /// Blocks until the lock is available, or until the configured
    /// `lock_timeout` expires.
    pub fn acquire(&self, block_id: BlockId, mode: LockMode) -> Result<BlockLock, CacheError> {
        let frame = self.frame(block_id)?;
        self.lock_frame(block_id, &frame, mode)
    }

    /// Allocate a block and return it write-locked and zeroed.
    ///
    /// Reuses the free list before growing the device.
    pub fn allocate_block(&self) -> Result<BlockLock, CacheError> {
        let mut superblock = self.superblock.lock();

        let head = superblock.free_list_head;
        if head != SUPERBLOCK_ID {
            let mut lock = self.acquire(head, LockMode::Write)?;
            if BlockHeader::block_type_of(lock.data()) != Ok(BlockType::Free) {
                return Err(CacheError::FreeListCorrupt(head));
            }
            let next = read_u64(lock.data(), NEXT_FREE_OFFSET);
            superblock.free_list_head = next;
            superblock.free_blocks = superblock.free_blocks.saturating_sub(1);
            lock.data_mut()?.fill(0);
            trace!(block_id = head, "reused free block");
            return Ok(lock);
        }

        let block_id = self.storage.lock().extend(1)?;
        superblock.total_blocks = block_id + 1;
        let frame = {
            let mut frames = self.frames.lock();
            let frame = frames.install(block_id, Page::new(self.block_size), true);
            self.evict_excess(&mut frames)?;
            frame
        };
        trace!(block_id, "extended device");
        self.lock_frame(block_id, &frame, LockMode::Write)
    }

    /// Return a write-locked block to the free list.
    pub fn free_block(&self, mut lock: BlockLock) -> Result<(), CacheError> {
        let block_id = lock.block_id();
        let mut superblock = self.superblock.lock();
        let data = lock.data_mut()?;
        data.fill(0);
        BlockHeader::stamp(data, BlockType::Free);
        write_u64(data, NEXT_FREE_OFFSET, superblock.free_list_head);
        superblock.free_list_head = block_id;
        superblock.free_blocks += 1;
        drop(lock);
        trace!(block_id, "freed block");
        Ok(())
    }

    /// Hint that `block_id` will be needed soon.
    ///
    /// Never blocks. Does nothing if the block is resident or prefetching is
    /// disabled.
    pub fn prefetch(&self, block_id: BlockId) {
        let Some(sender) = &self.prefetcher else {
            return;
        };
        if block_id == SUPERBLOCK_ID || self.is_resident(block_id) {
            return;
        }
        // A closed channel means the prefetch thread is gone; the hint is dropped
        let _ = sender.lock().send(block_id);
    }

    /// Write every dirty frame and the superblock, then sync the device.
    pub fn flush(&self) -> Result<(), CacheError> {
        let snapshot: Vec<(BlockId, Frame)> = self
            .frames
            .lock()
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.frame.clone()))
            .collect();

        let mut written = 0usize;
        for (block_id, frame) in snapshot {
            // Recursive so a thread holding read locks of its own can flush
            let page = frame.data.read_recursive();
            if frame.dirty.swap(false, Ordering::AcqRel) {
                let mut sealed = Page::from_bytes(page.as_bytes());
                sealed.seal();
                self.storage.lock().write_block(block_id, sealed.as_bytes())?;
                self.counters.writebacks.fetch_add(1, Ordering::Relaxed);
                written += 1;
            }
        }

        let superblock = self.superblock();
        let mut storage = self.storage.lock();
        storage.write_block(SUPERBLOCK_ID, superblock.to_page().as_bytes())?;
        storage.sync()?;
        debug!(
            written,
            total_blocks = superblock.total_blocks,
            free_blocks = superblock.free_blocks,
            "flushed buffer cache"
        );
        Ok(())
    }

    /// Write back and drop every frame that is not locked.
    ///
    /// Pinned frames stay resident.
    pub fn evict_unpinned(&self) -> Result<usize, CacheError> {
        let mut frames = self.frames.lock();
        let candidates: Vec<BlockId> = frames
            .entries
            .iter()
            .filter(|(_, entry)| is_unpinned(&entry.frame))
            .map(|(id, _)| *id)
            .collect();
        let count = candidates.len();
        for block_id in candidates {
            self.evict(&mut frames, block_id)?;
        }
        Ok(count)
    }

    /// Find or load the frame for `block_id`.
    fn frame(&self, block_id: BlockId) -> Result<Frame, CacheError> {
        if block_id == SUPERBLOCK_ID {
            return Err(CacheError::ReservedBlock(block_id));
        }

        let mut frames = self.frames.lock();
        if let Some(frame) = frames.touch(block_id) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(frame);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let page = self.load(block_id)?;
        let frame = frames.install(block_id, page, false);
        self.evict_excess(&mut frames)?;
        Ok(frame)
    }

    /// Read and verify a block from storage.
    fn load(&self, block_id: BlockId) -> Result<Page, CacheError> {
        let mut page = Page::new(self.block_size);
        self.storage
            .lock()
            .read_block(block_id, page.as_bytes_mut())?;
        if let Err(source) = page.verify_checksum() {
            warn!(block_id, error = %source, "block failed checksum verification");
            return Err(CacheError::Corruption { block_id, source });
        }
        Ok(page)
    }

    fn lock_frame(
        &self,
        block_id: BlockId,
        frame: &Frame,
        mode: LockMode,
    ) -> Result<BlockLock, CacheError> {
        let timeout_err = || CacheError::LockTimeout { block_id, mode };
        let guard = match (mode, self.config.lock_timeout) {
            (LockMode::Read, None) => Guard::Read(frame.data.read_arc()),
            (LockMode::Write, None) => Guard::Write(frame.data.write_arc()),
            (LockMode::Read, Some(timeout)) => Guard::Read(
                frame
                    .data
                    .try_read_arc_for(timeout)
                    .ok_or_else(timeout_err)?,
            ),
            (LockMode::Write, Some(timeout)) => Guard::Write(
                frame
                    .data
                    .try_write_arc_for(timeout)
                    .ok_or_else(timeout_err)?,
            ),
        };
        self.counters.locks_acquired.fetch_add(1, Ordering::Relaxed);
        Ok(BlockLock {
            block_id,
            guard,
            dirty: Arc::clone(&frame.dirty),
            counters: Arc::clone(&self.counters),
        })
    }

    /// Evict least recently used unpinned frames until within capacity.
    fn evict_excess(&self, frames: &mut FrameTable) -> Result<(), CacheError> {
        let excess = frames.entries.len().saturating_sub(self.config.capacity);
        if excess == 0 {
            return Ok(());
        }

        let mut candidates: Vec<(u64, BlockId)> = frames
            .entries
            .iter()
            .filter(|(_, entry)| is_unpinned(&entry.frame))
            .map(|(id, entry)| (entry.last_used, *id))
            .collect();
        candidates.sort_unstable();

        for (_, block_id) in candidates.into_iter().take(excess) {
            self.evict(frames, block_id)?;
        }
        Ok(())
    }

    /// Drop one unpinned frame, writing it back first if dirty.
    fn evict(&self, frames: &mut FrameTable, block_id: BlockId) -> Result<(), CacheError> {
        let Some(entry) = frames.entries.get(&block_id) else {
            return Ok(());
        };
        if entry.frame.dirty.load(Ordering::Acquire) {
            // Unpinned, so the lock is free
            if let Some(mut page) = entry.frame.data.try_write() {
                page.seal();
                self.storage.lock().write_block(block_id, page.as_bytes())?;
                self.counters.writebacks.fetch_add(1, Ordering::Relaxed);
            } else {
                return Ok(());
            }
        }
        frames.entries.remove(&block_id);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        trace!(block_id, "evicted block");
        Ok(())
    }

    /// Load a block on behalf of the prefetch thread.
    fn prefetch_now(&self, block_id: BlockId) {
        let mut frames = self.frames.lock();
        if frames.entries.contains_key(&block_id) {
            return;
        }
        match self.load(block_id) {
            Ok(page) => {
                frames.install(block_id, page, false);
                self.counters.prefetches.fetch_add(1, Ordering::Relaxed);
                if let Err(error) = self.evict_excess(&mut frames) {
                    debug!(block_id, %error, "eviction after prefetch failed");
                }
            }
            // The demand load reports the failure if the block is really needed
            Err(error) => debug!(block_id, %error, "prefetch failed"),
        }
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("block_size", &self.block_size)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn is_unpinned(frame: &Frame) -> bool {
    Arc::strong_count(&frame.data) == 1
}

fn spawn_prefetcher(cache: Weak<BufferCache>) -> Option<mpsc::Sender<BlockId>> {
    let (sender, receiver) = mpsc::channel::<BlockId>();
    let spawned = thread::Builder::new()
        .name("store-prefetch".to_string())
        .spawn(move || {
            // Ends when the cache (and with it the sender) is dropped
            for block_id in receiver {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.prefetch_now(block_id);
            }
        });
    match spawned {
        Ok(_) => Some(sender),
        Err(error) => {
            warn!(%error, "could not start prefetch thread; prefetching disabled");
            None
        }
    }
}

/// Errors from the buffer cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// Superblock error.
    #[error("superblock error: {0}")]
    Superblock(#[from] SuperblockError),
    /// A block failed checksum verification.
    #[error("block {block_id} is corrupt: {source}")]
    Corruption { block_id: BlockId, source: PageError },
    /// A lock could not be acquired within the configured timeout.
    #[error("timed out acquiring {mode:?} lock on block {block_id}")]
    LockTimeout { block_id: BlockId, mode: LockMode },
    /// A write was attempted through a read lock.
    #[error("block {0} is not write-locked")]
    NotWriteLocked(BlockId),
    /// A read-only transaction asked for write access.
    #[error("transaction is read-only")]
    ReadOnly,
    /// The block cannot be served as a frame.
    #[error("block {0} is reserved")]
    ReservedBlock(BlockId),
    /// The free list names a block that is not free.
    #[error("free list entry {0} is not a free block")]
    FreeListCorrupt(BlockId),
    /// `create` was called on a device that already has blocks.
    #[error("storage is not empty")]
    NotEmpty,
}

impl CacheError {
    /// Whether this error reports damaged data rather than a transient failure.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. }
                | Self::FreeListCorrupt(_)
                | Self::Superblock(_)
                | Self::Storage(StorageError::Corruption(_))
        )
    }
}
