//! Database file I/O operations.
//!
//! This module handles reading and writing blocks to the database file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::io::{Storage, StorageError, check_bounds, check_buffer};
use crate::storage::page::BlockId;
use crate::storage::superblock::{self, SuperblockError};

/// A database file handle with low-level block I/O operations.
#[derive(Debug)]
pub struct DatabaseFile {
    file: File,
    path: PathBuf,
    block_size: usize,
    total_blocks: u64,
}

impl DatabaseFile {
    /// Create a new, empty database file at the given path.
    ///
    /// Returns an error if the file already exists. The caller (the buffer
    /// cache) is responsible for writing the superblock.
    pub fn create(path: &Path, block_size: usize) -> Result<Self, FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }
        superblock::check_block_size(block_size).map_err(FileError::Superblock)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(FileError::Io)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size,
            total_blocks: 0,
        })
    }

    /// Open an existing database file.
    ///
    /// The block size is taken from the superblock.
    pub fn open(path: &Path) -> Result<Self, FileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        let mut prefix = [0u8; superblock::PREFIX_SIZE];
        file.read_exact(&mut prefix).map_err(FileError::Io)?;
        let block_size = superblock::peek_block_size(&prefix).map_err(FileError::Superblock)?;

        let len = file.metadata().map_err(FileError::Io)?.len();
        let block_size_u64 = block_size as u64;
        if len % block_size_u64 != 0 {
            return Err(FileError::TruncatedFile {
                len,
                block_size,
            });
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size,
            total_blocks: len / block_size_u64,
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    const fn offset_of(&self, block_id: BlockId) -> u64 {
        block_id * self.block_size as u64
    }
}

impl Storage for DatabaseFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, block_id: BlockId, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(block_id, self.total_blocks)?;
        check_buffer(self.block_size, buf.len())?;

        let offset = self.offset_of(block_id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, block_id: BlockId, buf: &[u8]) -> Result<(), StorageError> {
        check_bounds(block_id, self.total_blocks)?;
        check_buffer(self.block_size, buf.len())?;

        let offset = self.offset_of(block_id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn extend(&mut self, count: u64) -> Result<BlockId, StorageError> {
        let first_new_block = self.total_blocks;
        let new_total = first_new_block + count;

        // set_len zero-fills the new region
        self.file.set_len(self.offset_of(new_total))?;
        self.total_blocks = new_total;

        Ok(first_new_block)
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }
}

/// Errors that can occur when opening or creating database files.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(std::io::Error),
    /// File already exists.
    #[error("file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    /// Superblock error.
    #[error("superblock error: {0}")]
    Superblock(SuperblockError),
    /// File length is not a whole number of blocks.
    #[error("file length {len} is not a multiple of block size {block_size}")]
    TruncatedFile { len: u64, block_size: usize },
}
