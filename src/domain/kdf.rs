//! At-rest sealing for the private key.
//!
//! A sealed blob is `MAGIC || salt_len (u32 LE) || salt || nonce (12) || ciphertext`.
//! The sealing key is derived from a passphrase with Argon2id and the key bytes
//! are encrypted with AES-256-GCM, so tampering or a wrong passphrase is
//! detected by the AEAD tag rather than surfacing as a corrupt key later.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{password_hash::SaltString, Algorithm, Argon2, Params, PasswordHasher, Version};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Leading bytes of every sealed blob.
pub const SEALED_MAGIC: &[u8; 4] = b"DVK1";

const NONCE_LEN: usize = 12;

/// Errors while sealing or unsealing key material.
#[derive(Debug, Error)]
pub enum KdfError {
    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Unsealing failed: wrong passphrase or tampered data")]
    Decryption,

    #[error("Invalid sealed key format")]
    InvalidFormat,
}

/// Parsed sealed envelope.
#[derive(Debug, Clone)]
struct SealedKey {
    salt: String,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl SealedKey {
    fn to_bytes(&self) -> Vec<u8> {
        let salt = self.salt.as_bytes();
        let mut out =
            Vec::with_capacity(SEALED_MAGIC.len() + 4 + salt.len() + NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(SEALED_MAGIC);
        out.extend_from_slice(&(salt.len() as u32).to_le_bytes());
        out.extend_from_slice(salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, KdfError> {
        let rest = bytes
            .strip_prefix(SEALED_MAGIC.as_slice())
            .ok_or(KdfError::InvalidFormat)?;
        let (len_bytes, rest) = rest.split_at_checked(4).ok_or(KdfError::InvalidFormat)?;
        let mut len = [0u8; 4];
        len.copy_from_slice(len_bytes);
        let salt_len = u32::from_le_bytes(len) as usize;

        let (salt, rest) = rest.split_at_checked(salt_len).ok_or(KdfError::InvalidFormat)?;
        let (nonce_bytes, ciphertext) =
            rest.split_at_checked(NONCE_LEN).ok_or(KdfError::InvalidFormat)?;

        let salt = std::str::from_utf8(salt)
            .map_err(|_| KdfError::InvalidFormat)?
            .to_string();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        Ok(Self {
            salt,
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Whether `bytes` look like a sealed blob (as opposed to raw key bytes).
#[must_use]
pub fn is_sealed(bytes: &[u8]) -> bool {
    bytes.starts_with(SEALED_MAGIC)
}

fn derive_key(passphrase: &str, salt: &SaltString) -> Result<Zeroizing<[u8; 32]>, KdfError> {
    let params = Params::new(47104, 1, 1, Some(32))
        .map_err(|e| KdfError::Derivation(format!("Invalid Argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let hash = argon2
        .hash_password(passphrase.as_bytes(), salt)
        .map_err(|e| KdfError::Derivation(e.to_string()))?;
    let output = hash
        .hash
        .ok_or_else(|| KdfError::Derivation("Hash output missing".to_string()))?;

    let bytes = output.as_bytes();
    if bytes.len() < 32 {
        return Err(KdfError::Derivation("Hash too short".to_string()));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes[..32]);
    Ok(key)
}

/// Seal raw key bytes under `passphrase`.
///
/// A fresh salt and nonce are drawn for every call.
///
/// # Errors
/// Returns error if key derivation or encryption fails.
pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, KdfError> {
    let salt = SaltString::generate(&mut OsRng);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt)?;
    let cipher =
        Aes256Gcm::new_from_slice(key.as_slice()).map_err(|e| KdfError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| KdfError::Encryption(e.to_string()))?;

    Ok(SealedKey {
        salt: salt.to_string(),
        nonce,
        ciphertext,
    }
    .to_bytes())
}

/// Recover raw key bytes from a sealed blob.
///
/// # Errors
/// Returns `KdfError::Decryption` on a wrong passphrase or tampered data and
/// `KdfError::InvalidFormat` when the envelope itself is malformed.
pub fn unseal(sealed: &[u8], passphrase: &str) -> Result<Zeroizing<Vec<u8>>, KdfError> {
    let envelope = SealedKey::from_bytes(sealed)?;
    let salt = SaltString::from_b64(&envelope.salt).map_err(|_| KdfError::InvalidFormat)?;

    let key = derive_key(passphrase, &salt)?;
    let cipher =
        Aes256Gcm::new_from_slice(key.as_slice()).map_err(|e| KdfError::Derivation(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_ref())
        .map(Zeroizing::new)
        .map_err(|_| KdfError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal_roundtrip() {
        let plaintext = b"serialized client key bytes";
        let sealed = seal(plaintext, "correct-horse-battery-staple").expect("seal");

        assert!(is_sealed(&sealed));
        let opened = unseal(&sealed, "correct-horse-battery-staple").expect("unseal");
        assert_eq!(opened.as_slice(), plaintext);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = seal(b"key", "right").expect("seal");
        assert!(matches!(unseal(&sealed, "wrong"), Err(KdfError::Decryption)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut sealed = seal(b"key material", "pw").expect("seal");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(unseal(&sealed, "pw"), Err(KdfError::Decryption)));
    }

    #[test]
    fn test_truncated_envelope_is_invalid_format() {
        assert!(matches!(unseal(b"DVK1\x10", "pw"), Err(KdfError::InvalidFormat)));
        assert!(matches!(unseal(b"nope", "pw"), Err(KdfError::InvalidFormat)));
        assert!(!is_sealed(b"raw key"));
    }

    #[test]
    fn test_fresh_salt_per_seal() {
        let a = seal(b"same", "same").expect("seal");
        let b = seal(b"same", "same").expect("seal");
        assert_ne!(a, b);
    }
}
