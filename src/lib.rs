//! # DataVault
//!
//! Client-side custody of health data under fully homomorphic encryption.
//!
//! This crate provides:
//! - Key lifecycle for the private, public and compute keys
//! - Typed ciphertexts and compact batches with strict serialization
//! - A confidentiality-scoped blob store
//! - The remote task protocol (upload key, start, poll, fetch) with its
//!   status taxonomy and retry policy
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: Core types (ciphertext widths, file table, task model)
//! - `ports`: Trait definitions for storage and the compute service
//! - `adapters`: Concrete implementations (tfhe-rs, filesystem, HTTP)
//! - `application`: Use cases orchestrating domain and ports
//! - `config`: Environment-driven configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use application::TaskError;
pub use config::VaultConfig;

/// Result type for DataVault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for DataVault
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(#[from] domain::CryptoError),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] adapters::StorageError),

    #[error("Network error: {0}")]
    Network(#[from] ports::NetworkError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("No identity available: the private key is missing")]
    NoIdentity,

    #[error("Nothing stored at {0}")]
    Missing(String),

    #[error("{0} has no decrypt kind")]
    NotDecryptable(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background work failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
