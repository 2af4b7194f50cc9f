//! Compute service port: the remote task protocol.
//!
//! The compute service receives the compute key and ciphertexts only. Every
//! call is one network round trip; polling and retry policy live in the
//! orchestrator, not here.

use async_trait::async_trait;

use crate::domain::{StatusReport, TaskFamily, TaskId, Uid};

/// Errors surfaced by a single protocol call.
///
/// All of them are safe to retry at the level of the whole call.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Response is not HTTP")]
    NonHttpResponse,

    #[error("Request failed with status code: {0}")]
    InvalidHttpCode(u16),

    #[error("Failed to parse response: {0}")]
    ResultParsing(String),

    #[error("Error: {0}")]
    Message(String),
}

impl NetworkError {
    /// Whether the failure happened below the protocol (connection, timeout).
    ///
    /// Only these are retried automatically by the poll loop.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NonHttpResponse)
    }
}

/// Trait for the remote compute protocol.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Upload a serialized compute key for `family`.
    ///
    /// # Returns
    /// The server-issued UID under which the key is cached remotely.
    ///
    /// # Errors
    /// Returns `NetworkError` if the call fails or the body lacks a `uid`.
    async fn add_key(&self, family: TaskFamily, key: Vec<u8>) -> Result<Uid, NetworkError>;

    /// Start a task on an encrypted payload.
    ///
    /// # Errors
    /// Returns `NetworkError` if the call fails or the body lacks a `task_id`.
    async fn start_task(
        &self,
        family: TaskFamily,
        uid: &Uid,
        encrypted_input: Vec<u8>,
    ) -> Result<TaskId, NetworkError>;

    /// Query the status of a started task.
    ///
    /// # Errors
    /// Returns `NetworkError` on a failed call or a body that is not JSON.
    async fn task_status(
        &self,
        family: TaskFamily,
        task_id: &TaskId,
        uid: &Uid,
    ) -> Result<StatusReport, NetworkError>;

    /// Fetch the opaque result body of a task.
    ///
    /// # Errors
    /// Returns `NetworkError` if the call fails.
    async fn task_result(
        &self,
        family: TaskFamily,
        task_id: &TaskId,
        uid: &Uid,
    ) -> Result<Vec<u8>, NetworkError>;
}
