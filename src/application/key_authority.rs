//! Key authority: generation, caching and persistence of the three key roles.
//!
//! The private key is the root. It lives in the health-private scope, sealed
//! with the configured password when there is one. The public and compute
//! keys are derived from it on demand and persisted in the shared scope; when
//! either goes missing or fails to parse it is derived again.
//!
//! # Concurrency
//!
//! Each role has its own mutex, held for the whole load-or-generate step, so
//! at most one generation per role is ever in flight and later callers wait
//! for its result. Lock order is public/compute before private.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use zeroize::Zeroizing;

use crate::adapters::tfhe::{Ciphertext, CompactBatch, ComputeKey, PrivateKey, PublicKey};
use crate::adapters::StorageError;
use crate::domain::{kdf, CryptoError, DecryptKind, Persist, SleepSample, UintKind, VaultFile};
use crate::ports::BlobStore;
use crate::VaultError;

/// A stored blob decrypted through its static decrypt kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptedValue {
    Scalar { kind: UintKind, value: u32 },
    Array(Vec<u16>),
    SleepSamples(Vec<SleepSample>),
}

/// Fingerprints of the keys currently held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFingerprints {
    pub private: String,
    pub public: String,
    pub compute: String,
    pub compute_size_bytes: usize,
}

fn storage<E: Into<StorageError>>(e: E) -> VaultError {
    VaultError::Storage(e.into())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of the key roles for one store.
pub struct KeyAuthority<S: BlobStore> {
    store: Arc<S>,
    password: Option<Zeroizing<String>>,
    private: Mutex<Option<Arc<PrivateKey>>>,
    public: Mutex<Option<Arc<PublicKey>>>,
    compute: Mutex<Option<Arc<ComputeKey>>>,
}

impl<S> KeyAuthority<S>
where
    S: BlobStore,
    S::Error: Into<StorageError>,
{
    /// Create an authority over `store`. Nothing is loaded until first use.
    ///
    /// With a `password`, the private key is sealed at rest.
    pub fn new(store: Arc<S>, password: Option<Zeroizing<String>>) -> Self {
        Self {
            store,
            password,
            private: Mutex::new(None),
            public: Mutex::new(None),
            compute: Mutex::new(None),
        }
    }

    /// Load every key role, generating whatever is missing. Idempotent.
    ///
    /// # Errors
    /// Returns error if a stored private key cannot be read or unsealed, or
    /// if generation or persistence fails.
    pub fn ensure_keys_exist(&self) -> Result<KeyFingerprints, VaultError> {
        let private = self.load_or_generate_private()?;
        let public = self.public_key()?;
        let compute = self.compute_key()?;
        Ok(KeyFingerprints {
            private: private.fingerprint().to_string(),
            public: public.fingerprint().to_string(),
            compute: compute.fingerprint().to_string(),
            compute_size_bytes: compute.size_bytes(),
        })
    }

    /// Fingerprints of the stored keys, without generating anything.
    ///
    /// # Errors
    /// Returns `VaultError::NoIdentity` if there is no private key.
    pub fn fingerprints(&self) -> Result<KeyFingerprints, VaultError> {
        let private = self.private_key()?;
        let public = self.public_key()?;
        let compute = self.compute_key()?;
        Ok(KeyFingerprints {
            private: private.fingerprint().to_string(),
            public: public.fingerprint().to_string(),
            compute: compute.fingerprint().to_string(),
            compute_size_bytes: compute.size_bytes(),
        })
    }

    /// The private key, from cache or store. Never generated here.
    ///
    /// # Errors
    /// Returns `VaultError::NoIdentity` if no private key is stored.
    pub fn private_key(&self) -> Result<Arc<PrivateKey>, VaultError> {
        let mut slot = lock(&self.private);
        if let Some(key) = slot.as_ref() {
            return Ok(Arc::clone(key));
        }
        let key = Arc::new(self.read_private()?.ok_or(VaultError::NoIdentity)?);
        *slot = Some(Arc::clone(&key));
        Ok(key)
    }

    /// The public key, derived again if missing or unreadable.
    ///
    /// # Errors
    /// Returns `VaultError::NoIdentity` if it must be derived and there is no
    /// private key.
    pub fn public_key(&self) -> Result<Arc<PublicKey>, VaultError> {
        let mut slot = lock(&self.public);
        if let Some(key) = slot.as_ref() {
            return Ok(Arc::clone(key));
        }
        let key = match self.read_derived::<PublicKey>(VaultFile::PublicKey)? {
            Some(key) => key,
            None => {
                let private = self.private_key()?;
                let key = PublicKey::derive(&private)?;
                self.persist(VaultFile::PublicKey, &key.to_bytes()?)?;
                tracing::info!("Public key {} stored", key.fingerprint());
                key
            }
        };
        let key = Arc::new(key);
        *slot = Some(Arc::clone(&key));
        Ok(key)
    }

    /// The compute key, derived again if missing or unreadable.
    ///
    /// # Errors
    /// Returns `VaultError::NoIdentity` if it must be derived and there is no
    /// private key.
    pub fn compute_key(&self) -> Result<Arc<ComputeKey>, VaultError> {
        let mut slot = lock(&self.compute);
        if let Some(key) = slot.as_ref() {
            return Ok(Arc::clone(key));
        }
        let key = match self.read_derived::<ComputeKey>(VaultFile::ServerKey)? {
            Some(key) => key,
            None => {
                let private = self.private_key()?;
                let key = ComputeKey::derive(&private)?;
                self.persist(VaultFile::ServerKey, &key.to_bytes()?)?;
                tracing::info!("Compute key {} stored", key.fingerprint());
                key
            }
        };
        let key = Arc::new(key);
        *slot = Some(Arc::clone(&key));
        Ok(key)
    }

    /// Delete all three keys and the task ledger.
    ///
    /// Every ciphertext encrypted so far becomes undecryptable.
    ///
    /// # Errors
    /// Returns error if a stored file cannot be deleted.
    pub fn reset(&self) -> Result<(), VaultError> {
        let mut public = lock(&self.public);
        let mut compute = lock(&self.compute);
        let mut private = lock(&self.private);

        for file in [
            VaultFile::ServerKey,
            VaultFile::PublicKey,
            VaultFile::ClientKey,
            VaultFile::TaskLedger,
        ] {
            self.store.delete(file, None).map_err(storage)?;
        }
        *public = None;
        *compute = None;
        *private = None;

        tracing::warn!("All keys deleted");
        Ok(())
    }

    /// Read a stored blob and decrypt it according to its decrypt kind.
    ///
    /// # Returns
    /// `None` if the blob does not exist.
    ///
    /// # Errors
    /// Returns `VaultError::NotDecryptable` for files without a decrypt kind,
    /// and crypto errors for blobs that do not parse under the current key.
    pub fn decrypt_file(
        &self,
        file: VaultFile,
        suffix: Option<&str>,
    ) -> Result<Option<DecryptedValue>, VaultError> {
        let kind = file
            .decrypt_kind()
            .ok_or(VaultError::NotDecryptable(file.name()))?;
        let Some(bytes) = self.store.read(file, suffix).map_err(storage)? else {
            return Ok(None);
        };
        let private = self.private_key()?;

        let value = match kind {
            DecryptKind::Scalar(kind) => DecryptedValue::Scalar {
                kind,
                value: Ciphertext::from_bytes(kind, &bytes)?.decrypt(&private),
            },
            DecryptKind::Array => {
                let items = CompactBatch::from_bytes((), &bytes)?.into_items()?;
                let values = items
                    .iter()
                    .map(|ct| {
                        ct.as_u16()?;
                        let value = ct.decrypt(&private);
                        u16::try_from(value).map_err(|_| CryptoError::Range {
                            kind: UintKind::U16,
                            value,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                DecryptedValue::Array(values)
            }
            DecryptKind::CipherTextList => {
                let items = CompactBatch::from_bytes((), &bytes)?.into_items()?;
                if items.len() % 3 != 0 {
                    return Err(CryptoError::CiphertextFormat(format!(
                        "{} items do not form sleep triples",
                        items.len()
                    ))
                    .into());
                }
                let samples = items
                    .chunks_exact(3)
                    .map(|t| {
                        SleepSample::decode(
                            t[0].decrypt(&private),
                            t[1].decrypt(&private),
                            t[2].decrypt(&private),
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                DecryptedValue::SleepSamples(samples)
            }
        };
        tracing::debug!("Decrypted {}", file.file_name(suffix));
        Ok(Some(value))
    }

    fn load_or_generate_private(&self) -> Result<Arc<PrivateKey>, VaultError> {
        let mut slot = lock(&self.private);
        if let Some(key) = slot.as_ref() {
            return Ok(Arc::clone(key));
        }

        let key = match self.read_private()? {
            Some(key) => {
                tracing::info!("Loaded private key {}", key.fingerprint());
                key
            }
            None => {
                let key = PrivateKey::generate()?;
                self.write_private(&key)?;
                key
            }
        };
        let key = Arc::new(key);
        *slot = Some(Arc::clone(&key));
        Ok(key)
    }

    fn read_private(&self) -> Result<Option<PrivateKey>, VaultError> {
        let Some(stored) = self.store.read(VaultFile::ClientKey, None).map_err(storage)? else {
            return Ok(None);
        };
        let stored = Zeroizing::new(stored);

        let key = if kdf::is_sealed(&stored) {
            let password = self.password.as_ref().ok_or(StorageError::MissingPassword)?;
            let plain = kdf::unseal(&stored, password).map_err(|e| {
                tracing::warn!("Private key unsealing failed: {e}");
                StorageError::KeyDecryption
            })?;
            PrivateKey::from_bytes((), &plain)?
        } else {
            let key = PrivateKey::from_bytes((), &stored)?;
            if self.password.is_some() {
                tracing::warn!("Private key was stored unsealed, sealing it now");
                self.write_private(&key)?;
            }
            key
        };
        Ok(Some(key))
    }

    fn write_private(&self, key: &PrivateKey) -> Result<(), VaultError> {
        let plain = Zeroizing::new(key.to_bytes()?);
        match &self.password {
            Some(password) => {
                let sealed = kdf::seal(&plain, password).map_err(CryptoError::from)?;
                self.persist(VaultFile::ClientKey, &sealed)?;
                tracing::info!("Private key {} stored sealed", key.fingerprint());
            }
            None => {
                self.persist(VaultFile::ClientKey, &plain)?;
                tracing::info!("Private key {} stored unsealed", key.fingerprint());
            }
        }
        Ok(())
    }

    fn read_derived<K: Persist<Layout = ()>>(&self, file: VaultFile) -> Result<Option<K>, VaultError> {
        let Some(bytes) = self.store.read(file, None).map_err(storage)? else {
            tracing::info!("{} missing, deriving it", file.name());
            return Ok(None);
        };
        match K::from_bytes((), &bytes) {
            Ok(key) => Ok(Some(key)),
            Err(CryptoError::KeyFormat(e)) => {
                tracing::warn!("{} unreadable ({e}), deriving it again", file.name());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, file: VaultFile, bytes: &[u8]) -> Result<(), VaultError> {
        self.store.write(file, None, Some(bytes)).map_err(storage)
    }
}
