//! Blob store port: confidentiality-scoped byte storage.
//!
//! This trait abstracts the storage backend (the local filesystem) from the
//! key authority and the client flows.

use std::path::PathBuf;

use crate::domain::VaultFile;

/// Key-value-by-name byte store partitioned into confidentiality scopes.
///
/// Each [`VaultFile`] statically declares its scope; implementations resolve
/// the scope to a physical location on every call.
pub trait BlobStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Deterministic location of a file instance. Pure, performs no I/O.
    ///
    /// The suffix is not checked here; `read` and `write` refuse suffixes
    /// that fail [`crate::domain::is_valid_suffix`].
    fn path_for(&self, file: VaultFile, suffix: Option<&str>) -> PathBuf;

    /// Replace the contents of a file instance.
    ///
    /// `None` or empty bytes delete the instance; deleting an absent
    /// instance is not an error. Readers never observe a partial write.
    ///
    /// # Errors
    /// Returns error if the underlying write or delete fails.
    fn write(
        &self,
        file: VaultFile,
        suffix: Option<&str>,
        bytes: Option<&[u8]>,
    ) -> Result<(), Self::Error>;

    /// Read a file instance.
    ///
    /// # Returns
    /// `None` if the instance does not exist.
    ///
    /// # Errors
    /// Returns error only on real I/O failures, never for "not found".
    fn read(&self, file: VaultFile, suffix: Option<&str>) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Delete a file instance.
    ///
    /// # Errors
    /// Returns error if the underlying delete fails.
    fn delete(&self, file: VaultFile, suffix: Option<&str>) -> Result<(), Self::Error> {
        self.write(file, suffix, None)
    }

    /// Suffixes of all stored instances of `file`, sorted, excluding previews.
    ///
    /// # Errors
    /// Returns error if the scope directory cannot be listed.
    fn list_instances(&self, file: VaultFile) -> Result<Vec<String>, Self::Error>;
}
