//! Overflow chains for large values.
//!
//! Values whose leaf pair would exceed a quarter of a node are stored out of
//! line in a chain of overflow blocks. The leaf keeps a small handle naming
//! the first block and the total length.
//!
//! # Overflow Block Format
//!
//! ```text
//! +----------------+----------------+----------------+------------------+
//! | Block Header   | Next Block ID  | Data Length    | Data...          |
//! | (8 bytes)      | (8 bytes)      | (4 bytes)      | (variable)       |
//! +----------------+----------------+----------------+------------------+
//! ```
//!
//! The last block of a chain has next block 0.
//!
//! # Stored Value Format
//!
//! The tree stores every value behind a one-byte tag:
//!
//! ```text
//! 0x00 | inline bytes...
//! 0x01 | first block (8 bytes) | total length (4 bytes)
//! ```

// Chunk lengths are bounded by the block size and always fit in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::cache::{BlockLock, CacheError, LockMode};
use crate::storage::page::{BlockHeader, BlockId, BlockType, SUPERBLOCK_ID, read_u32, read_u64};
use crate::storage::transaction::Transactor;

/// Offset of the next block pointer.
const NEXT_OFFSET: usize = BlockHeader::SIZE;

/// Offset of the chunk length.
const LEN_OFFSET: usize = NEXT_OFFSET + 8;

/// Offset where overflow data starts.
pub const OVERFLOW_DATA_OFFSET: usize = LEN_OFFSET + 4;

/// Tag byte for an inline stored value.
pub const TAG_INLINE: u8 = 0x00;

/// Tag byte for an out-of-line stored value.
pub const TAG_OVERFLOW: u8 = 0x01;

/// Encoded size of an overflow handle (without the tag).
pub const HANDLE_SIZE: usize = 12;

/// Encoded size of an out-of-line stored value (tag plus handle).
pub const STORED_HANDLE_SIZE: usize = 1 + HANDLE_SIZE;

/// Data bytes carried by one overflow block.
#[must_use]
pub const fn data_per_block(block_size: usize) -> usize {
    block_size - OVERFLOW_DATA_OFFSET
}

/// A reference to an overflow chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowHandle {
    /// First block of the chain.
    pub first_block: BlockId,
    /// Total length of the value.
    pub total_len: u32,
}

impl OverflowHandle {
    /// Serialize the handle to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; HANDLE_SIZE] {
        let mut buf = [0u8; HANDLE_SIZE];
        buf[0..8].copy_from_slice(&self.first_block.to_le_bytes());
        buf[8..12].copy_from_slice(&self.total_len.to_le_bytes());
        buf
    }

    /// Deserialize a handle. Returns `None` if `bytes` has the wrong length.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HANDLE_SIZE {
            return None;
        }
        Some(Self {
            first_block: read_u64(bytes, 0),
            total_len: read_u32(bytes, 8),
        })
    }
}

/// A decoded stored value, borrowing from its leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredValue<'a> {
    /// The value bytes themselves.
    Inline(&'a [u8]),
    /// A handle to an overflow chain.
    Overflow(OverflowHandle),
}

impl<'a> StoredValue<'a> {
    /// Decode a stored value from leaf bytes.
    pub fn decode(bytes: &'a [u8]) -> Result<Self, OverflowError> {
        match bytes.split_first() {
            Some((&TAG_INLINE, rest)) => Ok(Self::Inline(rest)),
            Some((&TAG_OVERFLOW, rest)) => OverflowHandle::from_bytes(rest)
                .map(Self::Overflow)
                .ok_or(OverflowError::BadStoredValue),
            _ => Err(OverflowError::BadStoredValue),
        }
    }

    /// Encode an inline value.
    #[must_use]
    pub fn encode_inline(value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + value.len());
        buf.push(TAG_INLINE);
        buf.extend_from_slice(value);
        buf
    }

    /// Encode an overflow handle.
    #[must_use]
    pub fn encode_overflow(handle: OverflowHandle) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STORED_HANDLE_SIZE);
        buf.push(TAG_OVERFLOW);
        buf.extend_from_slice(&handle.to_bytes());
        buf
    }

    /// Resolve to the full value, reading the chain if needed.
    pub fn resolve(self, txn: &Transactor) -> Result<Vec<u8>, OverflowError> {
        match self {
            Self::Inline(bytes) => Ok(bytes.to_vec()),
            Self::Overflow(handle) => read_overflow(txn, handle),
        }
    }

    /// The overflow chain this value owns, if any.
    #[must_use]
    pub const fn overflow(self) -> Option<OverflowHandle> {
        match self {
            Self::Inline(_) => None,
            Self::Overflow(handle) => Some(handle),
        }
    }
}

/// Write a value to a new overflow chain.
///
/// On failure, the blocks allocated so far are returned to the free list.
pub fn write_overflow(txn: &Transactor, value: &[u8]) -> Result<OverflowHandle, OverflowError> {
    let total_len =
        u32::try_from(value.len()).map_err(|_| OverflowError::ValueTooLarge(value.len()))?;
    if value.is_empty() {
        return Err(OverflowError::EmptyValue);
    }

    let chunk_size = data_per_block(txn.block_size());
    let mut first_block = SUPERBLOCK_ID;
    let mut prev: Option<BlockLock> = None;

    for chunk in value.chunks(chunk_size) {
        let mut lock = match txn.allocate_block() {
            Ok(lock) => lock,
            Err(e) => {
                drop(prev);
                if first_block != SUPERBLOCK_ID {
                    // Best effort: the original error is what the caller needs
                    let _ = free_overflow(txn, first_block);
                }
                return Err(e.into());
            }
        };
        let block_id = lock.block_id();

        let data = lock.data_mut()?;
        BlockHeader::stamp(data, BlockType::Overflow);
        data[LEN_OFFSET..LEN_OFFSET + 4].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
        data[OVERFLOW_DATA_OFFSET..OVERFLOW_DATA_OFFSET + chunk.len()].copy_from_slice(chunk);

        match prev.take() {
            None => first_block = block_id,
            Some(mut prev_lock) => {
                let prev_data = prev_lock.data_mut()?;
                prev_data[NEXT_OFFSET..NEXT_OFFSET + 8].copy_from_slice(&block_id.to_le_bytes());
            }
        }
        prev = Some(lock);
    }

    Ok(OverflowHandle {
        first_block,
        total_len,
    })
}

/// Read a value from its overflow chain.
pub fn read_overflow(txn: &Transactor, handle: OverflowHandle) -> Result<Vec<u8>, OverflowError> {
    let expected = handle.total_len as usize;
    let mut value = Vec::with_capacity(expected);
    let mut block_id = handle.first_block;

    while block_id != SUPERBLOCK_ID {
        let lock = txn.acquire(block_id, LockMode::Read)?;
        let data = lock.data();
        check_overflow_block(block_id, data)?;

        let len = read_u32(data, LEN_OFFSET) as usize;
        if len > data_per_block(data.len()) || value.len() + len > expected {
            return Err(OverflowError::LengthMismatch {
                expected,
                actual: value.len() + len,
            });
        }
        value.extend_from_slice(&data[OVERFLOW_DATA_OFFSET..OVERFLOW_DATA_OFFSET + len]);
        block_id = read_u64(data, NEXT_OFFSET);
    }

    if value.len() != expected {
        return Err(OverflowError::LengthMismatch {
            expected,
            actual: value.len(),
        });
    }
    Ok(value)
}

/// Free every block of an overflow chain.
///
/// Returns the number of blocks freed.
pub fn free_overflow(txn: &Transactor, first_block: BlockId) -> Result<u64, OverflowError> {
    let mut freed = 0;
    let mut block_id = first_block;

    while block_id != SUPERBLOCK_ID {
        let lock = txn.acquire(block_id, LockMode::Write)?;
        check_overflow_block(block_id, lock.data())?;
        let next = read_u64(lock.data(), NEXT_OFFSET);
        txn.free_block(lock)?;
        freed += 1;
        block_id = next;
    }

    Ok(freed)
}

fn check_overflow_block(block_id: BlockId, data: &[u8]) -> Result<(), OverflowError> {
    match BlockHeader::block_type_of(data) {
        Ok(BlockType::Overflow) => Ok(()),
        _ => Err(OverflowError::NotOverflow(block_id)),
    }
}

/// Errors that can occur during overflow operations.
#[derive(Debug, thiserror::Error)]
pub enum OverflowError {
    /// Buffer cache error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    /// A chain names a block that is not an overflow block.
    #[error("block {0} is not an overflow block")]
    NotOverflow(BlockId),
    /// The chain length disagrees with its handle.
    #[error("overflow length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    /// A stored value has an unknown tag or a malformed handle.
    #[error("malformed stored value")]
    BadStoredValue,
    /// Empty values are always stored inline.
    #[error("cannot store empty value in overflow")]
    EmptyValue,
    /// Value length does not fit the handle.
    #[error("value of {0} bytes is too large")]
    ValueTooLarge(usize),
}

impl OverflowError {
    /// Whether this error reports damaged data.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        match self {
            Self::Cache(e) => e.is_corruption(),
            Self::NotOverflow(_) | Self::LengthMismatch { .. } | Self::BadStoredValue => true,
            Self::EmptyValue | Self::ValueTooLarge(_) => false,
        }
    }
}
