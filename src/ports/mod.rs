//! Ports layer: Trait definitions for external operations.
//!
//! Following Hexagonal Architecture, these traits define the boundaries
//! between the application and external systems (filesystem, compute service).

mod blob_store;
mod compute_service;

pub use blob_store::BlobStore;
pub use compute_service::{ComputeService, NetworkError};
