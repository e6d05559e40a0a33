//! Wormscan Test Suite
//!
//! Scenario tests for the wormscan polling engine, run against the in-memory
//! backends of `wormscan-sync` and the RocksDB store.

pub mod tests;

// Re-export test utilities for external use
pub use tests::{Scenario, EMITTER};
