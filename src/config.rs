//! Environment-driven configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use zeroize::Zeroizing;

use crate::adapters::http::DEFAULT_TIMEOUT;
use crate::adapters::StorageError;
use crate::domain::MissingStatusPolicy;

const ROOT_ENV: &str = "DATAVAULT_ROOT";
const SERVER_URL_ENV: &str = "DATAVAULT_SERVER_URL";
const HTTP_TIMEOUT_ENV: &str = "DATAVAULT_HTTP_TIMEOUT_SECS";
const POLL_INTERVAL_ENV: &str = "DATAVAULT_POLL_INTERVAL_SECS";
const MISSING_STATUS_ENV: &str = "DATAVAULT_MISSING_STATUS";

const KEY_PASSWORD_FILE_ENV: &str = "DATAVAULT_KEY_PASSWORD_FILE";
const KEY_PASSWORD_DOCKER_SECRET_PATH: &str = "/run/secrets/datavault_key_password";
const KEY_PASSWORD_ENV_DEV: &str = "DATAVAULT_KEY_PASSWORD";

const DEFAULT_ROOT: &str = "./vault-data";

/// Runtime configuration of the vault.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Base directory of the scoped store.
    pub root: PathBuf,
    /// Root URL of the remote compute service, if any.
    pub server_url: Option<String>,
    pub http_timeout: Duration,
    /// Overrides every family's default poll interval when set.
    pub poll_interval: Option<Duration>,
    pub missing_status: MissingStatusPolicy,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            server_url: None,
            http_timeout: DEFAULT_TIMEOUT,
            poll_interval: None,
            missing_status: MissingStatusPolicy::default(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            tracing::warn!("Ignoring {name}={raw:?}: not a number of seconds");
            None
        }
    }
}

impl VaultConfig {
    /// Read the configuration from `DATAVAULT_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let missing_status = match std::env::var(MISSING_STATUS_ENV).as_deref() {
            Ok("restart") => MissingStatusPolicy::Restart,
            Ok("done") | Err(_) => MissingStatusPolicy::AssumeDone,
            Ok(other) => {
                tracing::warn!("Ignoring {MISSING_STATUS_ENV}={other:?}: expected done|restart");
                MissingStatusPolicy::AssumeDone
            }
        };

        Self {
            root: std::env::var(ROOT_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.root),
            server_url: std::env::var(SERVER_URL_ENV)
                .ok()
                .filter(|s| !s.trim().is_empty()),
            http_timeout: env_secs(HTTP_TIMEOUT_ENV).unwrap_or(defaults.http_timeout),
            poll_interval: env_secs(POLL_INTERVAL_ENV),
            missing_status,
        }
    }

    /// Password sealing the private key at rest, if one is configured.
    ///
    /// Sources, highest first: the file named by `DATAVAULT_KEY_PASSWORD_FILE`,
    /// the Docker secret, then `DATAVAULT_KEY_PASSWORD` in debug builds only.
    ///
    /// # Errors
    /// Returns `StorageError::MissingPassword` if a configured source is empty,
    /// and `StorageError::Io` if it cannot be read.
    pub fn key_password() -> Result<Option<Zeroizing<String>>, StorageError> {
        if let Ok(path) = std::env::var(KEY_PASSWORD_FILE_ENV) {
            return read_secret_file(Path::new(path.trim())).map(Some);
        }

        if Path::new(KEY_PASSWORD_DOCKER_SECRET_PATH).exists() {
            return read_secret_file(Path::new(KEY_PASSWORD_DOCKER_SECRET_PATH)).map(Some);
        }

        // Refused in release builds.
        if cfg!(debug_assertions) {
            if let Ok(v) = std::env::var(KEY_PASSWORD_ENV_DEV) {
                return non_empty(v).map(Some);
            }
        }

        Ok(None)
    }
}

fn read_secret_file(path: &Path) -> Result<Zeroizing<String>, StorageError> {
    let content = Zeroizing::new(std::fs::read_to_string(path)?);
    non_empty(content.to_string())
}

fn non_empty(raw: String) -> Result<Zeroizing<String>, StorageError> {
    let raw = Zeroizing::new(raw);
    let secret = raw.trim_end_matches(['\n', '\r']);
    if secret.is_empty() {
        return Err(StorageError::MissingPassword);
    }
    Ok(Zeroizing::new(secret.to_string()))
}
