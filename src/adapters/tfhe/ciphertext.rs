//! Scalar ciphertexts of the four supported widths.

use tfhe::prelude::*;
use tfhe::{FheUint10, FheUint16, FheUint4, FheUint8};

use super::batch::BatchBuilder;
use super::keys::{PrivateKey, PublicKey};
use crate::adapters::bridge;
use crate::domain::{CryptoError, Persist, UintKind};

/// One encrypted integer, tagged with its width.
#[derive(Clone)]
pub enum Ciphertext {
    U4(FheUint4),
    U8(FheUint8),
    U10(FheUint10),
    U16(FheUint16),
}

/// Key a value can be encrypted under.
#[derive(Debug, Clone, Copy)]
pub enum EncryptionKey<'a> {
    Private(&'a PrivateKey),
    Public(&'a PublicKey),
}

impl<'a> From<&'a PrivateKey> for EncryptionKey<'a> {
    fn from(key: &'a PrivateKey) -> Self {
        Self::Private(key)
    }
}

impl<'a> From<&'a PublicKey> for EncryptionKey<'a> {
    fn from(key: &'a PublicKey) -> Self {
        Self::Public(key)
    }
}

macro_rules! encrypt_as {
    ($variant:ident, $fhe:ty, $clear:ty, $kind:expr, $value:expr, $key:expr) => {{
        let clear = <$clear>::try_from($value).map_err(|_| CryptoError::Range {
            kind: $kind,
            value: $value,
        })?;
        <$fhe>::try_encrypt(clear, $key.inner())
            .map(Ciphertext::$variant)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }};
}

/// Compact public keys only encrypt lists, so a scalar goes through a
/// one-item batch.
fn encrypt_public(kind: UintKind, value: u32, key: &PublicKey) -> Result<Ciphertext, CryptoError> {
    let mut builder = BatchBuilder::new(key);
    builder.push(kind, value)?;
    let item = builder
        .seal()
        .into_items()?
        .into_iter()
        .next()
        .ok_or_else(|| CryptoError::Encryption("Public encryption produced no ciphertext".into()))?;
    if item.kind() != kind {
        return Err(CryptoError::KindMismatch {
            expected: kind,
            found: item.kind(),
        });
    }
    Ok(item)
}

impl Ciphertext {
    /// Encrypt `value` as a ciphertext of `kind`.
    ///
    /// # Errors
    /// Returns `CryptoError::Range` if `value` does not fit `kind`.
    pub fn encrypt<'k>(
        kind: UintKind,
        value: u32,
        key: impl Into<EncryptionKey<'k>>,
    ) -> Result<Self, CryptoError> {
        kind.check(value)?;
        let key = match key.into() {
            EncryptionKey::Private(key) => key,
            EncryptionKey::Public(key) => return encrypt_public(kind, value, key),
        };
        match kind {
            UintKind::U4 => encrypt_as!(U4, FheUint4, u8, kind, value, key),
            UintKind::U8 => encrypt_as!(U8, FheUint8, u8, kind, value, key),
            UintKind::U10 => encrypt_as!(U10, FheUint10, u16, kind, value, key),
            UintKind::U16 => encrypt_as!(U16, FheUint16, u16, kind, value, key),
        }
    }

    #[must_use]
    pub fn decrypt(&self, key: &PrivateKey) -> u32 {
        let ck = key.inner();
        match self {
            Self::U4(ct) => u32::from(FheDecrypt::<u8>::decrypt(ct, ck)),
            Self::U8(ct) => u32::from(FheDecrypt::<u8>::decrypt(ct, ck)),
            Self::U10(ct) => u32::from(FheDecrypt::<u16>::decrypt(ct, ck)),
            Self::U16(ct) => u32::from(FheDecrypt::<u16>::decrypt(ct, ck)),
        }
    }

    #[must_use]
    pub fn kind(&self) -> UintKind {
        match self {
            Self::U4(_) => UintKind::U4,
            Self::U8(_) => UintKind::U8,
            Self::U10(_) => UintKind::U10,
            Self::U16(_) => UintKind::U16,
        }
    }

    /// Borrow the 16-bit handle, failing for any other width.
    pub(crate) fn as_u16(&self) -> Result<&FheUint16, CryptoError> {
        match self {
            Self::U16(ct) => Ok(ct),
            other => Err(CryptoError::KindMismatch {
                expected: UintKind::U16,
                found: other.kind(),
            }),
        }
    }
}

impl std::fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ciphertext").field(&self.kind()).finish()
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    bridge::serialize(value)
        .map(bridge::ForeignBuffer::into_vec)
        .map_err(|e| CryptoError::CiphertextFormat(format!("Failed to serialize ciphertext: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(kind: UintKind, bytes: &[u8]) -> Result<T, CryptoError> {
    bridge::deserialize(bytes).map_err(|e| {
        CryptoError::CiphertextFormat(format!("Failed to deserialize {kind} ciphertext: {e}"))
    })
}

impl Persist for Ciphertext {
    type Layout = UintKind;

    fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::U4(ct) => encode(ct),
            Self::U8(ct) => encode(ct),
            Self::U10(ct) => encode(ct),
            Self::U16(ct) => encode(ct),
        }
    }

    fn from_bytes(kind: UintKind, bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(match kind {
            UintKind::U4 => Self::U4(decode(kind, bytes)?),
            UintKind::U8 => Self::U8(decode(kind, bytes)?),
            UintKind::U10 => Self::U10(decode(kind, bytes)?),
            UintKind::U16 => Self::U16(decode(kind, bytes)?),
        })
    }
}
