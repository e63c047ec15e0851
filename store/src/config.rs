//! Store configuration.
//!
//! This module loads the settings for opening a store from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `STORE_DATABASE_PATH`: Database file (default: `./data/store.db`)
//! - `STORE_BLOCK_SIZE`: Block size for new databases (default: `4096`)
//! - `STORE_CACHE_BLOCKS`: Frames kept in memory (default: `4096`)
//! - `STORE_LOCK_TIMEOUT_MS`: Give up on a block lock after this long (default: wait forever)
//! - `STORE_PREFETCH`: Run the prefetch thread, `true` or `false` (default: `true`)
//!
//! # Invariants
//!
//! - `block_size` is a power of two within the supported range
//! - `cache_blocks` is at least 1
//! - every variable is optional

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::cache::{CacheConfig, DEFAULT_CACHE_BLOCKS};
use crate::storage::page::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

const DATABASE_PATH: &str = "STORE_DATABASE_PATH";
const BLOCK_SIZE: &str = "STORE_BLOCK_SIZE";
const CACHE_BLOCKS: &str = "STORE_CACHE_BLOCKS";
const LOCK_TIMEOUT_MS: &str = "STORE_LOCK_TIMEOUT_MS";
const PREFETCH: &str = "STORE_PREFETCH";

/// Store configuration.
///
/// # Post-conditions
///
/// When constructed via `from_env()`, `block_size` and
/// `cache_blocks` are valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Database file.
    pub database_path: PathBuf,
    /// Block size used when creating a database. An existing database keeps
    /// the block size recorded in its superblock.
    pub block_size: usize,
    /// Soft limit on frames kept in memory.
    pub cache_blocks: usize,
    /// Give up on a block lock after this long.
    pub lock_timeout: Option<Duration>,
    /// Run the background prefetch thread.
    pub prefetch: bool,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

impl StoreConfig {
    /// Default database file.
    pub const DEFAULT_DATABASE_PATH: &'static str = "./data/store.db";

    /// Defaults for a database at `database_path`.
    #[must_use]
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            lock_timeout: None,
            prefetch: true,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or if the
    /// block size or cache size is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_path = lookup(DATABASE_PATH)
            .map_or_else(|| PathBuf::from(Self::DEFAULT_DATABASE_PATH), PathBuf::from);

        let mut config = Self::new(database_path);
        if let Some(value) = lookup(BLOCK_SIZE) {
            config.block_size = parse_number(BLOCK_SIZE, &value)?;
        }
        if let Some(value) = lookup(CACHE_BLOCKS) {
            config.cache_blocks = parse_number(CACHE_BLOCKS, &value)?;
        }
        if let Some(value) = lookup(LOCK_TIMEOUT_MS) {
            config.lock_timeout = Some(Duration::from_millis(parse_number(LOCK_TIMEOUT_MS, &value)?));
        }
        if let Some(value) = lookup(PREFETCH) {
            config.prefetch = parse_bool(PREFETCH, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the block size for new databases.
    #[must_use]
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the number of frames kept in memory.
    #[must_use]
    pub const fn with_cache_blocks(mut self, cache_blocks: usize) -> Self {
        self.cache_blocks = cache_blocks;
        self
    }

    /// Set the lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Enable or disable prefetching.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the block size is not a power of two in the
    /// supported range, or if the cache holds no frames.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(ConfigError::InvalidValue {
                name: BLOCK_SIZE.to_string(),
                message: format!(
                    "{} is not a power of two between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}",
                    self.block_size
                ),
            });
        }
        if self.cache_blocks == 0 {
            return Err(ConfigError::InvalidValue {
                name: CACHE_BLOCKS.to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// The buffer cache settings.
    #[must_use]
    pub const fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_blocks,
            lock_timeout: self.lock_timeout,
            prefetch: self.prefetch,
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}' is not a valid number"),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not true or false"),
        }),
    }
}
