//! Dedupstore test and validation crate
//!
//! End-to-end checks of the engine's guarantees: dedup idempotence, index
//! soundness, encryption round trips, block reconstruction, KEK path-only
//! rotation, proof-of-ownership single use and persistence across reopen.

pub mod harness;

pub use harness::{fast_config, init_tracing, seeded_bytes, TestStore};

#[cfg(test)]
mod dedup_tests;
#[cfg(test)]
mod encryption_tests;
#[cfg(test)]
mod persistence_tests;
