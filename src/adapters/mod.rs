//! Adapters layer: Concrete implementations of ports.
//!
//! These modules contain the actual integration with external libraries:
//! - `bridge`: owned foreign buffers and the strict bincode codec
//! - `tfhe`: tfhe-rs keys, ciphertexts and homomorphic operations
//! - `fs_store`: filesystem blob store with scoped directories
//! - `http`: reqwest client for the remote compute service
//! - `local`: in-process compute service
//! - `sanitize`: redaction of identifiers and secrets in logs

pub mod bridge;
pub mod fs_store;
pub mod http;
pub mod local;
pub mod sanitize;
pub mod tfhe;

// Re-export storage error for lib.rs
pub use fs_store::StorageError;
