//! End-to-end tests through the `Database` facade.
//!
//! Each test file covers one scenario with deterministic inputs.

#![cfg(test)]

mod test_concurrency;
mod test_faults;
mod test_iteration;
mod test_overflow;
mod test_persistence;
mod test_rebalance;
