//! Filesystem adapter: implementation of `BlobStore`.
//!
//! Layout: `<root>/<scope>/v12/<file name>`. Scopes resolve to directories on
//! every call. Writes go to a temporary file in the target directory and are
//! renamed into place, so readers see either the old or the new contents.
//!
//! # Permissions
//!
//! On unix, private scope directories are created `0700` and their files
//! `0600`; shared files are `0644` so cooperating local processes can read them.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::NamedTempFile;

use crate::domain::{is_valid_suffix, Scope, VaultFile};
use crate::ports::BlobStore;

/// Store layout version, one directory level below each scope.
pub const LAYOUT_VERSION: &str = "v12";

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid instance suffix {0:?}")]
    InvalidSuffix(String),

    #[error("Key decryption failed: wrong password or corrupted data")]
    KeyDecryption,

    #[error(
        "Missing key password: the private key is sealed; provide DATAVAULT_KEY_PASSWORD_FILE (or mount /run/secrets/datavault_key_password)"
    )]
    MissingPassword,
}

/// Scoped blob store rooted at a directory.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FsBlobStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, scope: Scope) -> PathBuf {
        self.root.join(scope.dir_name()).join(LAYOUT_VERSION)
    }

    fn ensure_scope_dir(&self, scope: Scope) -> io::Result<PathBuf> {
        let dir = self.scope_dir(scope);
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        if scope.is_private() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(dir)
    }

    /// Path of a file instance, refusing suffixes that would leave the scope.
    fn checked_path(&self, file: VaultFile, suffix: Option<&str>) -> Result<PathBuf, StorageError> {
        match suffix {
            Some(suffix) if !is_valid_suffix(suffix) => {
                Err(StorageError::InvalidSuffix(suffix.to_string()))
            }
            _ => Ok(self.path_for(file, suffix)),
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    fn replace(&self, scope: Scope, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let dir = self.ensure_scope_dir(scope)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if scope.is_private() { 0o600 } else { 0o644 };
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
        }

        tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    type Error = StorageError;

    fn path_for(&self, file: VaultFile, suffix: Option<&str>) -> PathBuf {
        self.scope_dir(file.scope()).join(file.file_name(suffix))
    }

    fn write(
        &self,
        file: VaultFile,
        suffix: Option<&str>,
        bytes: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let path = self.checked_path(file, suffix)?;
        let lock = self.lock_for(&path);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        match bytes.filter(|b| !b.is_empty()) {
            Some(bytes) => {
                self.replace(file.scope(), &path, bytes)?;
                tracing::debug!("Wrote {} ({} bytes)", file.file_name(suffix), bytes.len());
            }
            None => match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Deleted {}", file.file_name(suffix)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    fn read(&self, file: VaultFile, suffix: Option<&str>) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.checked_path(file, suffix)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_instances(&self, file: VaultFile) -> Result<Vec<String>, StorageError> {
        let entries = match fs::read_dir(self.scope_dir(file.scope())) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut suffixes = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(suffix) = entry.file_name().to_str().and_then(|n| file.suffix_of(n)) {
                suffixes.push(suffix);
            }
        }
        suffixes.sort();
        Ok(suffixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        store
            .write(VaultFile::WeightAvg, None, Some(b"ciphertext"))
            .expect("write");
        assert_eq!(
            store.read(VaultFile::WeightAvg, None).expect("read"),
            Some(b"ciphertext".to_vec())
        );
    }

    #[test]
    fn test_missing_read_is_absent() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        assert_eq!(store.read(VaultFile::SleepScore, Some("01-01-2025")).expect("read"), None);
    }

    #[test]
    fn test_delete_is_write() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        store.write(VaultFile::PublicKey, None, Some(b"pk")).expect("write");
        store.write(VaultFile::PublicKey, None, None).expect("delete");
        assert_eq!(store.read(VaultFile::PublicKey, None).expect("read"), None);

        // Deleting again is not an error, and empty bytes also delete.
        store.write(VaultFile::PublicKey, None, None).expect("delete absent");
        store.write(VaultFile::PublicKey, None, Some(b"pk")).expect("write");
        store.write(VaultFile::PublicKey, None, Some(&[])).expect("empty write");
        assert_eq!(store.read(VaultFile::PublicKey, None).expect("read"), None);
    }

    #[test]
    fn test_path_derivation() {
        let store = FsBlobStore::new("/vault");
        assert_eq!(
            store.path_for(VaultFile::ClientKey, None),
            PathBuf::from("/vault/health-private/v12/clientKey")
        );
        assert_eq!(
            store.path_for(VaultFile::WeightList, Some("01-01-2025_07-01-2025")),
            PathBuf::from("/vault/shared/v12/weightList-01-01-2025_07-01-2025.fheencrypted")
        );
        assert_eq!(
            store.path_for(VaultFile::ConcretePrivateKey, None),
            PathBuf::from("/vault/ads-private/v12/concretePrivateKey")
        );
    }

    #[test]
    fn test_suffixed_instances_coexist() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        store.write(VaultFile::SleepList, Some("02-01-2025"), Some(b"b")).expect("write");
        store.write(VaultFile::SleepList, Some("01-01-2025"), Some(b"a")).expect("write");
        store.write(VaultFile::SleepList, None, Some(b"plain")).expect("write");
        store.write(VaultFile::SleepScore, Some("01-01-2025"), Some(b"s")).expect("write");
        fs::write(
            store.scope_dir(Scope::Shared).join("sleepList-01-01-2025-preview.fheencrypted"),
            b"p",
        )
        .expect("write preview");

        assert_eq!(
            store.list_instances(VaultFile::SleepList).expect("list"),
            vec!["01-01-2025".to_string(), "02-01-2025".to_string()]
        );
        assert_eq!(
            store.read(VaultFile::SleepList, Some("01-01-2025")).expect("read"),
            Some(b"a".to_vec())
        );
    }

    #[test]
    fn test_suffix_cannot_leave_scope() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let escape = "x/../../../health-private/v12/stolen";

        assert!(matches!(
            store.write(VaultFile::WeightList, Some(escape), Some(b"data")),
            Err(StorageError::InvalidSuffix(_))
        ));
        assert!(matches!(
            store.read(VaultFile::WeightList, Some(escape)),
            Err(StorageError::InvalidSuffix(_))
        ));
        assert!(matches!(
            store.delete(VaultFile::SleepList, Some("..")),
            Err(StorageError::InvalidSuffix(_))
        ));
        assert!(!store.scope_dir(Scope::HealthPrivate).exists());
    }

    #[test]
    fn test_list_on_empty_store() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        assert!(store.list_instances(VaultFile::WeightList).expect("list").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_scope_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store.write(VaultFile::ClientKey, None, Some(b"sk")).expect("write");
        store.write(VaultFile::PublicKey, None, Some(b"pk")).expect("write");

        let private = fs::metadata(store.path_for(VaultFile::ClientKey, None)).expect("meta");
        assert_eq!(private.permissions().mode() & 0o777, 0o600);
        let shared = fs::metadata(store.path_for(VaultFile::PublicKey, None)).expect("meta");
        assert_eq!(shared.permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn test_concurrent_writes_never_tear() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FsBlobStore::new(dir.path()));
        let payloads: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i; 64 * 1024]).collect();

        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .write(VaultFile::WeightList, None, Some(&payload))
                        .expect("write");
                    store.read(VaultFile::WeightList, None).expect("read")
                })
            })
            .collect();

        for handle in handles {
            let seen = handle.join().expect("join").expect("present");
            assert!(payloads.contains(&seen));
        }
    }
}
