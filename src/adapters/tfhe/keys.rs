//! The three key roles, wrapped around their tfhe-rs handles.
//!
//! Only the private key can decrypt. The public key encrypts; the compute key
//! (a compressed server key) lets the compute side run homomorphic operations
//! without ever decrypting. Both are pure derivations of the private key.

use std::fmt;

use tfhe::{ClientKey, CompactPublicKey, CompressedServerKey, ConfigBuilder};

use crate::adapters::bridge;
use crate::domain::{fingerprint, CryptoError, Persist};

/// Decryption key, root of the other two roles.
///
/// Never leaves the device. `Debug` shows only the fingerprint.
#[derive(Clone)]
pub struct PrivateKey {
    inner: ClientKey,
    fingerprint: String,
}

/// Encryption-only key.
#[derive(Clone)]
pub struct PublicKey {
    inner: CompactPublicKey,
    fingerprint: String,
}

/// Compressed key enabling homomorphic operations.
#[derive(Clone)]
pub struct ComputeKey {
    inner: CompressedServerKey,
    fingerprint: String,
    size_bytes: usize,
}

fn key_bytes<T: serde::Serialize>(what: &str, key: &T) -> Result<Vec<u8>, CryptoError> {
    bridge::serialize(key)
        .map(bridge::ForeignBuffer::into_vec)
        .map_err(|e| CryptoError::KeyFormat(format!("Failed to serialize {what}: {e}")))
}

fn parse_key<T: serde::de::DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T, CryptoError> {
    bridge::deserialize(bytes)
        .map_err(|e| CryptoError::KeyFormat(format!("Failed to deserialize {what}: {e}")))
}

impl PrivateKey {
    /// Generate a fresh private key with the default parameter set.
    ///
    /// # Errors
    /// Returns `CryptoError::KeyGeneration` if the new key cannot be encoded.
    pub fn generate() -> Result<Self, CryptoError> {
        tracing::info!("Generating private key...");
        let config = ConfigBuilder::default().build();
        let inner = ClientKey::generate(config);

        let bytes = key_bytes("client key", &inner)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let key = Self {
            inner,
            fingerprint: fingerprint(&bytes),
        };
        tracing::info!("Generated private key {}", key.fingerprint);
        Ok(key)
    }

    pub(crate) fn inner(&self) -> &ClientKey {
        &self.inner
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl PublicKey {
    /// Derive the public key. Each call draws fresh randomness.
    ///
    /// # Errors
    /// Returns `CryptoError::KeyGeneration` if the derived key cannot be encoded.
    pub fn derive(private: &PrivateKey) -> Result<Self, CryptoError> {
        let inner = CompactPublicKey::new(private.inner());
        let bytes = key_bytes("public key", &inner)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let key = Self {
            inner,
            fingerprint: fingerprint(&bytes),
        };
        tracing::debug!(
            "Derived public key {} from private key {}",
            key.fingerprint,
            private.fingerprint
        );
        Ok(key)
    }

    pub(crate) fn inner(&self) -> &CompactPublicKey {
        &self.inner
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl ComputeKey {
    /// Derive the compute key. This is the expensive derivation (seconds).
    ///
    /// # Errors
    /// Returns `CryptoError::KeyGeneration` if the derived key cannot be encoded.
    pub fn derive(private: &PrivateKey) -> Result<Self, CryptoError> {
        tracing::info!("Deriving compute key...");
        let inner = CompressedServerKey::new(private.inner());
        let bytes = key_bytes("compute key", &inner)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let key = Self {
            inner,
            fingerprint: fingerprint(&bytes),
            size_bytes: bytes.len(),
        };
        tracing::info!(
            "Derived compute key {} ({} bytes compressed)",
            key.fingerprint,
            key.size_bytes
        );
        Ok(key)
    }

    pub(crate) fn inner(&self) -> &CompressedServerKey {
        &self.inner
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Size of the serialized (compressed) key.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl Persist for PrivateKey {
    type Layout = ();

    fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        key_bytes("client key", &self.inner)
    }

    fn from_bytes(_: (), bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            inner: parse_key("client key", bytes)?,
            fingerprint: fingerprint(bytes),
        })
    }
}

impl Persist for PublicKey {
    type Layout = ();

    fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        key_bytes("public key", &self.inner)
    }

    fn from_bytes(_: (), bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            inner: parse_key("public key", bytes)?,
            fingerprint: fingerprint(bytes),
        })
    }
}

impl Persist for ComputeKey {
    type Layout = ();

    fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        key_bytes("compute key", &self.inner)
    }

    fn from_bytes(_: (), bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            inner: parse_key("compute key", bytes)?,
            fingerprint: fingerprint(bytes),
            size_bytes: bytes.len(),
        })
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for ComputeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeKey")
            .field("fingerprint", &self.fingerprint)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}
