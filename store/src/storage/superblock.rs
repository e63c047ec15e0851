//! Superblock structure and serialization.
//!
//! The superblock occupies block 0 and contains metadata about the database.

// Block sizes are bounded by MAX_BLOCK_SIZE and always fit in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{BlockId, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Page, read_u32};

/// Magic number identifying a database file: "BTKVSTOR"
pub const MAGIC: [u8; 8] = *b"BTKVSTOR";

/// Current format version.
///
/// Bump this on any change to block layouts, field widths, or the split rule.
pub const FORMAT_VERSION: u32 = 1;

/// Number of leading bytes needed to learn the block size of a file.
pub const PREFIX_SIZE: usize = 16;

/// Superblock field offsets.
///
/// The superblock has no generic block header; the magic starts at byte 0.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const BLOCK_SIZE: usize = 12;
    pub const TOTAL_BLOCKS: usize = 16;
    pub const ROOT_BLOCK: usize = 24;
    pub const FREE_LIST_HEAD: usize = 32;
    pub const FREE_BLOCKS: usize = 40;
    pub const NEXT_TXN_ID: usize = 48;
    pub const CHECKSUM: usize = 56;
    pub const END: usize = 60;
}

/// The superblock contains all metadata about the database file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version number.
    pub format_version: u32,
    /// Block size in bytes.
    pub block_size: u32,
    /// Number of blocks in use by the database (including the superblock).
    pub total_blocks: u64,
    /// Root block of the B-tree. Never changes after creation.
    pub root_block: BlockId,
    /// Head of the free block list (0 when empty).
    pub free_list_head: BlockId,
    /// Number of blocks on the free list.
    pub free_blocks: u64,
    /// Next transaction ID to assign.
    pub next_txn_id: u64,
}

impl Superblock {
    /// Create a new superblock for a fresh database.
    #[must_use]
    pub const fn new(block_size: usize) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            block_size: block_size as u32,
            total_blocks: 1,
            root_block: 0,
            free_list_head: 0,
            free_blocks: 0,
            next_txn_id: 1,
        }
    }

    /// Serialize the superblock to a block.
    #[must_use]
    pub fn to_page(&self) -> Page {
        let mut page = Page::new(self.block_size as usize);
        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::BLOCK_SIZE, self.block_size);
        page.write_u64(offsets::TOTAL_BLOCKS, self.total_blocks);
        page.write_u64(offsets::ROOT_BLOCK, self.root_block);
        page.write_u64(offsets::FREE_LIST_HEAD, self.free_list_head);
        page.write_u64(offsets::FREE_BLOCKS, self.free_blocks);
        page.write_u64(offsets::NEXT_TXN_ID, self.next_txn_id);

        let checksum = crc32fast::hash(page.read_bytes(0, offsets::CHECKSUM));
        page.write_u32(offsets::CHECKSUM, checksum);
        page
    }

    /// Deserialize a superblock from a block.
    pub fn from_page(page: &Page) -> Result<Self, SuperblockError> {
        if page.len() < offsets::END {
            return Err(SuperblockError::Truncated);
        }
        if page.read_bytes(offsets::MAGIC, 8) != MAGIC {
            return Err(SuperblockError::InvalidMagic);
        }

        let stored = page.read_u32(offsets::CHECKSUM);
        let actual = crc32fast::hash(page.read_bytes(0, offsets::CHECKSUM));
        if stored != actual {
            return Err(SuperblockError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let block_size = page.read_u32(offsets::BLOCK_SIZE);
        check_block_size(block_size as usize)?;
        if block_size as usize != page.len() {
            return Err(SuperblockError::InvalidBlockSize(block_size as usize));
        }

        Ok(Self {
            format_version,
            block_size,
            total_blocks: page.read_u64(offsets::TOTAL_BLOCKS),
            root_block: page.read_u64(offsets::ROOT_BLOCK),
            free_list_head: page.read_u64(offsets::FREE_LIST_HEAD),
            free_blocks: page.read_u64(offsets::FREE_BLOCKS),
            next_txn_id: page.read_u64(offsets::NEXT_TXN_ID),
        })
    }
}

/// Learn the block size of a database from the first bytes of its file.
pub fn peek_block_size(prefix: &[u8; PREFIX_SIZE]) -> Result<usize, SuperblockError> {
    if prefix[offsets::MAGIC..offsets::MAGIC + 8] != MAGIC {
        return Err(SuperblockError::InvalidMagic);
    }
    let block_size = read_u32(prefix, offsets::BLOCK_SIZE) as usize;
    check_block_size(block_size)?;
    Ok(block_size)
}

/// Validate a block size against the supported range.
pub const fn check_block_size(block_size: usize) -> Result<(), SuperblockError> {
    if block_size < MIN_BLOCK_SIZE || block_size > MAX_BLOCK_SIZE {
        return Err(SuperblockError::InvalidBlockSize(block_size));
    }
    Ok(())
}

/// Errors that can occur when working with superblocks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SuperblockError {
    /// Invalid magic number.
    #[error("invalid magic number")]
    InvalidMagic,
    /// Unsupported format version.
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),
    /// Block size outside the supported range.
    #[error("invalid block size: {0}")]
    InvalidBlockSize(usize),
    /// Superblock checksum mismatch.
    #[error("superblock checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Buffer too short to hold a superblock.
    #[error("superblock truncated")]
    Truncated,
}
