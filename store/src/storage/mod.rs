//! Block storage engine.
//!
//! A single-file key-value store organised as a B-tree over fixed-size
//! blocks.
//!
//! # File Format
//!
//! - Block 0: Superblock (format version, block size, root, free list)
//! - Every other block: B-tree node, overflow chain block, or free block,
//!   each starting with an 8-byte header carrying its type and a CRC32
//!
//! # Layers
//!
//! - `io`, `file`, `memory`: block devices
//! - `cache`: frames, block locks, eviction and write-back
//! - `transaction`: the context threaded through one logical operation
//! - `overflow`: out-of-line storage for large values
//! - `btree`: the index
//! - `database`: the facade owning all of the above
//!
//! # Usage
//!
//! ```no_run
//! use store::config::StoreConfig;
//! use store::storage::{Database, KeyRange};
//!
//! let db = Database::open_or_create(&StoreConfig::new("./data/store.db"))?;
//! db.insert(b"hello", b"world")?;
//! for entry in db.iterate(KeyRange::all())? {
//!     let (key, value) = entry?;
//!     println!("{key:?} = {value:?}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod btree;
pub mod cache;
pub mod database;
pub mod file;
pub mod io;
pub mod memory;
pub mod overflow;
pub mod page;
pub mod superblock;
pub mod transaction;

pub use btree::{BTree, BTreeError, Cursor, KeyRange, TreeStats};
pub use cache::{BlockLock, BufferCache, CacheConfig, CacheError, CacheStats, LockMode};
pub use database::{Database, DatabaseError};
pub use file::{DatabaseFile, FileError};
pub use io::{Storage, StorageError};
pub use memory::{FaultConfig, FaultInjector, MemoryStorage};
pub use page::{BlockId, BlockType, Page, PageError};
pub use superblock::{Superblock, SuperblockError};
pub use transaction::Transactor;
