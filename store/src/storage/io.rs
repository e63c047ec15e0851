//! Storage abstraction over a block device.
//!
//! This module provides a `Storage` trait that abstracts over block-based storage
//! operations, allowing the buffer cache to use real file I/O in production and
//! simulated in-memory storage in tests.
//!
//! # Design
//!
//! The trait is a minimal abstraction over the raw block operations:
//! - Block read/write
//! - Synchronization
//! - Growing the device
//!
//! Everything above raw blocks (superblock, free list, checksums, caching)
//! lives in the buffer cache so that every backend gets it for free.

use crate::storage::page::BlockId;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Block out of bounds.
    #[error("block {block_id} out of bounds (total blocks: {total_blocks})")]
    BlockOutOfBounds { block_id: BlockId, total_blocks: u64 },
    /// Buffer length does not match the device block size.
    #[error("buffer of {actual} bytes does not match block size {expected}")]
    WrongBufferSize { expected: usize, actual: usize },
    /// Injected fault for simulation.
    #[error("injected fault: {0}")]
    InjectedFault(String),
    /// Corruption detected.
    #[error("corruption: {0}")]
    Corruption(String),
}

/// Abstraction over block-based storage operations.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read_block` returns the last written content for a block
/// - `sync` makes all previous writes durable
/// - `extend` grows the device and returns the first new block id
/// - blocks created by `extend` read back as zeros until written
pub trait Storage: Send {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Read a block into `buf` (which must be exactly one block long).
    fn read_block(&mut self, block_id: BlockId, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write one block. The write may be buffered until `sync` is called.
    fn write_block(&mut self, block_id: BlockId, buf: &[u8]) -> Result<(), StorageError>;

    /// Sync all pending writes to durable storage.
    fn sync(&mut self) -> Result<(), StorageError>;

    /// Grow the device by `count` blocks.
    ///
    /// Returns the block id of the first new block.
    fn extend(&mut self, count: u64) -> Result<BlockId, StorageError>;

    /// Get the total number of blocks on the device.
    fn total_blocks(&self) -> u64;
}

/// Check a buffer against the device block size.
pub(crate) const fn check_buffer(expected: usize, actual: usize) -> Result<(), StorageError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StorageError::WrongBufferSize { expected, actual })
    }
}

/// Check a block id against the device size.
pub(crate) const fn check_bounds(block_id: BlockId, total_blocks: u64) -> Result<(), StorageError> {
    if block_id < total_blocks {
        Ok(())
    } else {
        Err(StorageError::BlockOutOfBounds {
            block_id,
            total_blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let e = StorageError::BlockOutOfBounds {
            block_id: 10,
            total_blocks: 5,
        };
        assert!(e.to_string().contains("block 10"));
        assert!(e.to_string().contains("total blocks: 5"));

        let e = StorageError::InjectedFault("test fault".to_string());
        assert!(e.to_string().contains("test fault"));
    }

    #[test]
    fn test_bounds_helpers() {
        assert!(check_bounds(4, 5).is_ok());
        assert!(check_bounds(5, 5).is_err());
        assert!(check_buffer(128, 128).is_ok());
        assert!(matches!(
            check_buffer(128, 64),
            Err(StorageError::WrongBufferSize {
                expected: 128,
                actual: 64
            })
        ));
    }
}
