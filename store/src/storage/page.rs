//! Block types and constants for the storage engine.
//!
//! The storage engine uses fixed-size blocks as the fundamental unit of I/O.
//! The block size is chosen when a database is created and recorded in the
//! superblock; every block of one database has the same size.

/// Default block size in bytes (4KB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 128;

/// Largest supported block size. Node offsets are 16-bit.
pub const MAX_BLOCK_SIZE: usize = 32768;

/// A block identifier (0-indexed block number).
pub type BlockId = u64;

/// Block 0 always holds the superblock.
pub const SUPERBLOCK_ID: BlockId = 0;

/// Block type identifiers stored in block headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    /// B-tree internal node
    BTreeInternal = 0x03,
    /// B-tree leaf node
    BTreeLeaf = 0x04,
    /// Overflow block for large values
    Overflow = 0x05,
    /// Free block (on free list)
    Free = 0x06,
}

impl TryFrom<u8> for BlockType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Self::BTreeInternal),
            0x04 => Ok(Self::BTreeLeaf),
            0x05 => Ok(Self::Overflow),
            0x06 => Ok(Self::Free),
            _ => Err(value),
        }
    }
}

/// Common header present at the start of every block except the superblock.
///
/// Layout:
/// - `block_type`: 1 byte
/// - `flags`: 1 byte
/// - `checksum`: 4 bytes (CRC32)
/// - `reserved`: 2 bytes
///
/// Total: 8 bytes
#[derive(Debug, Copy, Clone)]
pub struct BlockHeader {
    pub block_type: BlockType,
    pub flags: u8,
    pub checksum: u32,
}

impl BlockHeader {
    /// Size of the block header in bytes.
    pub const SIZE: usize = 8;

    /// Offset of the checksum field.
    const CHECKSUM_OFFSET: usize = 2;

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.block_type as u8;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 6-7 reserved
        buf
    }

    /// Deserialize a header from bytes.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self, PageError> {
        let block_type = BlockType::try_from(bytes[0]).map_err(PageError::InvalidBlockType)?;
        let flags = bytes[1];
        let checksum = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

        Ok(Self {
            block_type,
            flags,
            checksum,
        })
    }

    /// Write a fresh header (zero checksum) for `block_type` into `data`.
    pub fn stamp(data: &mut [u8], block_type: BlockType) {
        let header = Self {
            block_type,
            flags: 0,
            checksum: 0,
        };
        data[..Self::SIZE].copy_from_slice(&header.to_bytes());
    }

    /// Read the block type byte of a raw block.
    pub fn block_type_of(data: &[u8]) -> Result<BlockType, PageError> {
        let byte = data.first().copied().ok_or(PageError::Truncated)?;
        BlockType::try_from(byte).map_err(PageError::InvalidBlockType)
    }
}

/// A raw block buffer.
///
/// The buffer length is the block size of the database it belongs to.
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// Create a new zeroed block of `block_size` bytes.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size].into_boxed_slice(),
        }
    }

    /// Create a block from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
        }
    }

    /// Block size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is zero-length (never true for a real block).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the raw block data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable access to the raw block data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        read_u32(&self.data, offset)
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        read_u64(&self.data, offset)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Compute CRC32 checksum of the block (excluding the checksum field itself).
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        compute_checksum(&self.data)
    }

    /// Store a freshly computed checksum in the header.
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.write_u32(BlockHeader::CHECKSUM_OFFSET, checksum);
    }

    /// Verify the stored checksum against the block contents.
    pub fn verify_checksum(&self) -> Result<(), PageError> {
        let expected = self.read_u32(BlockHeader::CHECKSUM_OFFSET);
        let actual = self.compute_checksum();
        if expected == actual {
            Ok(())
        } else {
            Err(PageError::ChecksumMismatch { expected, actual })
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("len", &self.data.len())
            .field("first_16_bytes", &&self.data[..self.data.len().min(16)])
            .finish_non_exhaustive()
    }
}

/// Compute the CRC32 of a raw block, treating the checksum field as zero.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[0..2]); // block_type + flags
    hasher.update(&[0u8; 4]); // zero out checksum field
    hasher.update(&data[6..]); // rest of block
    hasher.finalize()
}

/// Read a little-endian u16 from a raw buffer.
#[must_use]
pub fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Read a little-endian u32 from a raw buffer.
#[must_use]
pub fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Read a little-endian u64 from a raw buffer.
#[must_use]
pub fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Write a little-endian u16 into a raw buffer.
pub fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Write a little-endian u64 into a raw buffer.
pub fn write_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Errors related to block operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PageError {
    /// Invalid block type byte.
    #[error("invalid block type: 0x{0:02x}")]
    InvalidBlockType(u8),
    /// Checksum mismatch.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Buffer shorter than a block header.
    #[error("block buffer truncated")]
    Truncated,
}
