//! B-tree over the buffer cache.
//!
//! Maps byte-string keys to byte-string values. Keys compare
//! lexicographically as unsigned bytes.
//!
//! # Structure
//!
//! - `key`: comparison, size limits, and key ranges
//! - `node`: the slotted node format shared by both node kinds
//! - `leaf` / `internal`: the node engines, working on one block's bytes
//! - `tree`: lookup, insert, remove, and verification with lock coupling
//! - `iter`: range iteration
//!
//! # Usage
//!
//! ```
//! use store::storage::btree::{BTree, KeyRange};
//! use store::storage::cache::{BufferCache, CacheConfig};
//! use store::storage::memory::MemoryStorage;
//! use store::storage::transaction::Transactor;
//!
//! let storage = Box::new(MemoryStorage::new(4096, 1));
//! let cache = BufferCache::create(storage, CacheConfig::default())?;
//!
//! let txn = Transactor::begin_write(&cache);
//! let tree = BTree::create(&txn)?;
//! tree.insert(&txn, b"apple", b"red")?;
//! tree.insert(&txn, b"banana", b"yellow")?;
//! txn.commit()?;
//!
//! let txn = Transactor::begin_read(&cache);
//! assert_eq!(tree.lookup(&txn, b"apple")?, Some(b"red".to_vec()));
//! let keys: Vec<Vec<u8>> = tree
//!     .iterate(&txn, KeyRange::all())?
//!     .map(|entry| entry.map(|(key, _)| key))
//!     .collect::<Result<_, _>>()?;
//! assert_eq!(keys, vec![b"apple".to_vec(), b"banana".to_vec()]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod internal;
pub mod iter;
pub mod key;
pub mod leaf;
pub mod node;
mod tree;

pub use internal::{InternalNode, InternalPair};
pub use iter::{Cursor, LeafIterator, SliceKeysIterator, SliceLeavesIterator};
pub use key::{AsKey, KeyRange, MAX_KEY_SIZE, compare, max_key_size};
pub use leaf::{InsertOutcome, LeafNode, LeafPair};
pub use node::{Node, NodeError, Side, nodecmp};
pub use tree::{BTree, BTreeError, TreeStats};
