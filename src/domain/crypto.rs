//! Cryptographic domain types shared by the client and compute sides.
//!
//! The FHE handles themselves live in `adapters::tfhe`; this module holds what
//! both sides agree on without touching the capability library: the error
//! taxonomy, the closed set of ciphertext widths, key fingerprints and the
//! persistence capability implemented by every key and ciphertext type.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::kdf::KdfError;

/// Error type for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Value {value} does not fit in {kind}")]
    Range { kind: UintKind, value: u32 },

    #[error("Invalid key format: {0}")]
    KeyFormat(String),

    #[error("Invalid ciphertext format: {0}")]
    CiphertextFormat(String),

    #[error("No compute key is active")]
    NoActiveKey,

    #[error("Statistics requested on an empty batch")]
    EmptyBatch,

    #[error("Ciphertext kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: UintKind, found: UintKind },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Key sealing failed: {0}")]
    Sealing(#[from] KdfError),
}

/// Bit-width of a scalar ciphertext.
///
/// The width bounds the clear values that may be encrypted and decides which
/// homomorphic operations can be combined (both operands must share a kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UintKind {
    U4,
    U8,
    U10,
    U16,
}

impl UintKind {
    /// Number of plaintext bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::U4 => 4,
            Self::U8 => 8,
            Self::U10 => 10,
            Self::U16 => 16,
        }
    }

    /// Largest clear value representable by this kind.
    #[must_use]
    pub const fn max_value(self) -> u32 {
        (1 << self.bits()) - 1
    }

    /// Check that `value` fits, returning `CryptoError::Range` otherwise.
    pub fn check(self, value: u32) -> Result<(), CryptoError> {
        if value > self.max_value() {
            return Err(CryptoError::Range { kind: self, value });
        }
        Ok(())
    }
}

impl fmt::Display for UintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uint{}", self.bits())
    }
}

/// Byte-level persistence capability shared by keys, ciphertexts and batches.
///
/// `Layout` carries whatever must be known statically to decode the bytes:
/// `()` for self-describing types, the [`UintKind`] for scalar ciphertexts,
/// which are stored untagged so the compute service can read them directly.
pub trait Persist: Sized {
    type Layout: Copy;

    /// Serialize to the exact bytes handed to storage or the network.
    ///
    /// # Errors
    /// Returns an error if the capability library fails to serialize.
    fn to_bytes(&self) -> Result<Vec<u8>, CryptoError>;

    /// Rebuild from bytes produced by [`Persist::to_bytes`].
    ///
    /// # Errors
    /// Returns `KeyFormat` or `CiphertextFormat` on corrupt input; never a
    /// partially valid value.
    fn from_bytes(layout: Self::Layout, bytes: &[u8]) -> Result<Self, CryptoError>;
}

/// Compute a fingerprint for key identification using SHA-256.
///
/// Only the first 8 bytes of the digest are kept; the result identifies a key
/// in logs and caches without revealing anything about it.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(bytes);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
