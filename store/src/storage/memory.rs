//! In-memory storage for testing.
//!
//! This module provides an in-memory implementation of the `Storage` trait
//! with deterministic fault injection:
//! - Block-level read/write errors (by rate or for a named block)
//! - Byte-level corruption on read (bit flips)
//! - Sync failures
//!
//! The fault state sits behind a shared [`FaultInjector`] handle so a test
//! can keep steering faults after the storage has been handed to a cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::{Storage, StorageError, check_bounds, check_buffer};
use crate::storage::page::BlockId;

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of block corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
            sync_error_rate: 0.001,
            corruption_rate: 0.001,
        }
    }
}

/// Statistics about in-memory storage operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryStorageStats {
    /// Number of block reads.
    pub reads: u64,
    /// Number of block writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of corrupted blocks returned.
    pub corrupted_reads: u64,
}

struct FaultState {
    config: FaultConfig,
    failing_reads: HashSet<BlockId>,
    corrupt_reads: HashSet<BlockId>,
    rng: StdRng,
    stats: MemoryStorageStats,
}

impl FaultState {
    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Corrupt a block by flipping random bits.
    fn corrupt(&mut self, buf: &mut [u8]) {
        // Flip 1-8 distinct random bits
        let num_flips = self.rng.random_range(1..=8);
        let mut flipped = HashSet::new();
        while flipped.len() < num_flips {
            let byte_offset = self.rng.random_range(0..buf.len());
            let bit = self.rng.random_range(0..8u8);
            if flipped.insert((byte_offset, bit)) {
                buf[byte_offset] ^= 1 << bit;
            }
        }
    }
}

/// Shared handle for steering the faults of a [`MemoryStorage`].
#[derive(Clone)]
pub struct FaultInjector {
    state: Arc<Mutex<FaultState>>,
}

impl FaultInjector {
    /// Replace the fault configuration.
    pub fn set_config(&self, config: FaultConfig) {
        self.state.lock().config = config;
    }

    /// Make every read of `block_id` fail until [`Self::heal`] is called.
    pub fn fail_reads_of(&self, block_id: BlockId) {
        self.state.lock().failing_reads.insert(block_id);
    }

    /// Make every read of `block_id` return damaged bytes until [`Self::heal`].
    pub fn corrupt_reads_of(&self, block_id: BlockId) {
        self.state.lock().corrupt_reads.insert(block_id);
    }

    /// Clear all block-specific failures and rate-based faults.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.failing_reads.clear();
        state.corrupt_reads.clear();
        state.config = FaultConfig::no_faults();
    }

    /// Get a snapshot of the current statistics.
    #[must_use]
    pub fn stats(&self) -> MemoryStorageStats {
        self.state.lock().stats.clone()
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FaultInjector")
            .field("config", &state.config)
            .field("failing_reads", &state.failing_reads)
            .field("corrupt_reads", &state.corrupt_reads)
            .finish_non_exhaustive()
    }
}

/// In-memory storage implementation for deterministic testing.
///
/// Blocks that have never been written read back as zeros, the same as a
/// freshly extended file. The seed ensures deterministic behavior: the same
/// seed and config produce the same sequence of faults.
pub struct MemoryStorage {
    blocks: HashMap<BlockId, Box<[u8]>>,
    block_size: usize,
    total_blocks: u64,
    faults: FaultInjector,
}

impl MemoryStorage {
    /// Create an empty device with no faults.
    #[must_use]
    pub fn new(block_size: usize, seed: u64) -> Self {
        Self::with_config(block_size, seed, FaultConfig::default())
    }

    /// Create an empty device with a custom fault configuration.
    #[must_use]
    pub fn with_config(block_size: usize, seed: u64, config: FaultConfig) -> Self {
        let state = FaultState {
            config,
            failing_reads: HashSet::new(),
            corrupt_reads: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
            stats: MemoryStorageStats::default(),
        };
        Self {
            blocks: HashMap::new(),
            block_size,
            total_blocks: 0,
            faults: FaultInjector {
                state: Arc::new(Mutex::new(state)),
            },
        }
    }

    /// Get a handle for injecting faults later on.
    #[must_use]
    pub fn fault_injector(&self) -> FaultInjector {
        self.faults.clone()
    }
}

impl Storage for MemoryStorage {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, block_id: BlockId, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(block_id, self.total_blocks)?;
        check_buffer(self.block_size, buf.len())?;

        let mut state = self.faults.state.lock();
        state.stats.reads += 1;

        // Check for injected read error
        let rate = state.config.read_error_rate;
        if state.failing_reads.contains(&block_id) || state.should_inject_fault(rate) {
            state.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(format!(
                "simulated read error on block {block_id}"
            )));
        }

        match self.blocks.get(&block_id) {
            Some(block) => buf.copy_from_slice(block),
            None => buf.fill(0),
        }

        // Check for corruption
        let rate = state.config.corruption_rate;
        if state.corrupt_reads.contains(&block_id) || state.should_inject_fault(rate) {
            state.stats.corrupted_reads += 1;
            state.corrupt(buf);
        }

        Ok(())
    }

    fn write_block(&mut self, block_id: BlockId, buf: &[u8]) -> Result<(), StorageError> {
        check_bounds(block_id, self.total_blocks)?;
        check_buffer(self.block_size, buf.len())?;

        {
            let mut state = self.faults.state.lock();
            state.stats.writes += 1;

            let rate = state.config.write_error_rate;
            if state.should_inject_fault(rate) {
                state.stats.injected_write_errors += 1;
                return Err(StorageError::InjectedFault(format!(
                    "simulated write error on block {block_id}"
                )));
            }
        }

        self.blocks.insert(block_id, buf.into());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        let mut state = self.faults.state.lock();
        state.stats.syncs += 1;

        let rate = state.config.sync_error_rate;
        if state.should_inject_fault(rate) {
            state.stats.injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        // Writes are already "durable"
        Ok(())
    }

    fn extend(&mut self, count: u64) -> Result<BlockId, StorageError> {
        let first_new_block = self.total_blocks;
        self.total_blocks += count;
        Ok(first_new_block)
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 128;

    #[test]
    fn test_read_write_roundtrip() {
        let mut storage = MemoryStorage::new(BLOCK, 42);
        storage.extend(4).expect("extend");

        let data = vec![9u8; BLOCK];
        storage.write_block(3, &data).expect("write");

        let mut buf = vec![0u8; BLOCK];
        storage.read_block(3, &mut buf).expect("read");
        assert_eq!(buf, data);

        // Unwritten blocks are zeros
        storage.read_block(1, &mut buf).expect("read");
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_bounds() {
        let mut storage = MemoryStorage::new(BLOCK, 42);
        storage.extend(1).expect("extend");
        let mut buf = vec![0u8; BLOCK];
        assert!(matches!(
            storage.read_block(1, &mut buf),
            Err(StorageError::BlockOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_fail_reads_of_block() {
        let mut storage = MemoryStorage::new(BLOCK, 42);
        storage.extend(3).expect("extend");
        let faults = storage.fault_injector();
        faults.fail_reads_of(2);

        let mut buf = vec![0u8; BLOCK];
        assert!(storage.read_block(1, &mut buf).is_ok());
        assert!(matches!(
            storage.read_block(2, &mut buf),
            Err(StorageError::InjectedFault(_))
        ));
        assert_eq!(faults.stats().injected_read_errors, 1);

        faults.heal();
        assert!(storage.read_block(2, &mut buf).is_ok());
    }

    #[test]
    fn test_fault_injection_deterministic() {
        let config = FaultConfig {
            read_error_rate: 0.5,
            ..FaultConfig::default()
        };

        let mut results1 = Vec::new();
        let mut storage1 = MemoryStorage::with_config(BLOCK, 12345, config.clone());
        storage1.extend(1).expect("extend");
        let mut buf = vec![0u8; BLOCK];
        for _ in 0..100 {
            results1.push(storage1.read_block(0, &mut buf).is_ok());
        }

        let mut results2 = Vec::new();
        let mut storage2 = MemoryStorage::with_config(BLOCK, 12345, config);
        storage2.extend(1).expect("extend");
        for _ in 0..100 {
            results2.push(storage2.read_block(0, &mut buf).is_ok());
        }

        assert_eq!(results1, results2);
        assert!(results1.iter().any(|ok| *ok));
        assert!(results1.iter().any(|ok| !*ok));
    }

    #[test]
    fn test_corruption_flips_bits() {
        let config = FaultConfig {
            corruption_rate: 1.0,
            ..FaultConfig::default()
        };
        let mut storage = MemoryStorage::with_config(BLOCK, 7, config);
        storage.extend(1).expect("extend");
        storage.write_block(0, &[0u8; BLOCK]).expect("write");

        let mut buf = vec![0u8; BLOCK];
        storage.read_block(0, &mut buf).expect("read");
        assert!(buf.iter().any(|&b| b != 0));
        assert_eq!(storage.fault_injector().stats().corrupted_reads, 1);
    }
}
