//! A persistent key-value store.
//!
//! Keys and values are byte strings. Pairs live in a B-tree over fixed-size
//! blocks, read and written through a buffer cache with per-block locks,
//! so readers and writers can work on the same tree from many threads.
//!
//! Life of a write:
//!  1. `Database::insert` begins a write transaction
//!  2. The tree descends from the root, splitting full nodes on the way
//!  3. The leaf is updated in its cached frame
//!  4. Commit flushes dirty frames and the superblock

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod storage;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

pub use config::{ConfigError, StoreConfig};
pub use storage::{Database, DatabaseError, KeyRange};
