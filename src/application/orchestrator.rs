//! Remote task orchestrator.
//!
//! Per family the life cycle is: upload the compute key once (the returned
//! UID is cached in the task ledger, bound to the key fingerprint), start a
//! task with an encrypted payload, poll its status, fetch the result.
//!
//! The ledger is a small JSON file in the shared scope, so a cancelled poll
//! can be resumed by a later process without restarting the task.
//!
//! Retry policy: transport failures and `Wait` statuses are retried by the
//! poll loop; everything else propagates immediately.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::tfhe::ComputeKey;
use crate::adapters::StorageError;
use crate::domain::{
    body_status, classify_body, MissingStatusPolicy, Persist, StatusClass, StatusReport,
    TaskFamily, TaskId, Uid, VaultFile,
};
use crate::ports::{BlobStore, ComputeService};
use crate::VaultError;

/// Errors specific to the task life cycle.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task for {family} must be restarted (status: {status})")]
    MustRestart { family: TaskFamily, status: String },

    #[error("Polling {0} was cancelled; the task can be resumed")]
    Cancelled(TaskFamily),

    #[error("No task started for {0}")]
    NotStarted(TaskFamily),

    #[error("{0} has no local kernel")]
    Unsupported(TaskFamily),

    #[error("Unexpected result for {family}: {reason}")]
    InvalidResult { family: TaskFamily, reason: String },
}

/// Cached server state for one family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
    /// Fingerprint of the compute key the UID was issued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    #[serde(default)]
    families: BTreeMap<TaskFamily, LedgerEntry>,
}

/// One status poll, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledStatus {
    pub class: StatusClass,
    pub report: StatusReport,
}

enum Step {
    Wait,
    Ready(Vec<u8>),
}

fn storage<E: Into<StorageError>>(e: E) -> VaultError {
    VaultError::Storage(e.into())
}

/// Drives remote tasks for every family.
pub struct TaskOrchestrator<C: ComputeService, S: BlobStore> {
    service: Arc<C>,
    store: Arc<S>,
    policy: MissingStatusPolicy,
    poll_interval: Option<Duration>,
    /// Indexed by `TaskFamily as usize`.
    families: [tokio::sync::Mutex<()>; 3],
    ledger: Mutex<()>,
}

impl<C, S> TaskOrchestrator<C, S>
where
    C: ComputeService,
    S: BlobStore,
    S::Error: Into<StorageError>,
{
    pub fn new(service: Arc<C>, store: Arc<S>) -> Self {
        Self {
            service,
            store,
            policy: MissingStatusPolicy::default(),
            poll_interval: None,
            families: Default::default(),
            ledger: Mutex::new(()),
        }
    }

    /// How bodies without a `status` field are classified.
    #[must_use]
    pub fn with_missing_status_policy(mut self, policy: MissingStatusPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Use `interval` between polls for every family.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn poll_interval(&self, family: TaskFamily) -> Duration {
        self.poll_interval.unwrap_or_else(|| family.poll_interval())
    }

    /// Cached ledger state for `family`.
    ///
    /// # Errors
    /// Returns error if the ledger cannot be read.
    pub fn ledger_entry(&self, family: TaskFamily) -> Result<LedgerEntry, VaultError> {
        let _held = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .read_ledger()?
            .families
            .remove(&family)
            .unwrap_or_default())
    }

    /// Drop the cached UID and task for `family`; the next run uploads again.
    ///
    /// # Errors
    /// Returns error if the ledger cannot be written.
    pub async fn forget(&self, family: TaskFamily) -> Result<(), VaultError> {
        let _family = self.lock_family(family).await;
        self.update_ledger(family, |entry| *entry = LedgerEntry::default())
    }

    /// Return the cached UID for `key`, uploading the key if there is none.
    ///
    /// A UID issued for another compute key is never reused.
    ///
    /// # Errors
    /// Returns error if the upload fails or the ledger cannot be written.
    pub async fn upload_compute_key_if_needed(
        &self,
        family: TaskFamily,
        key: &ComputeKey,
    ) -> Result<Uid, VaultError> {
        let _family = self.lock_family(family).await;
        self.upload_locked(family, key).await
    }

    /// Start a task, superseding any task cached for the family.
    ///
    /// # Errors
    /// Returns error if the call fails or the ledger cannot be written.
    pub async fn start_task(
        &self,
        family: TaskFamily,
        uid: &Uid,
        encrypted_input: Vec<u8>,
    ) -> Result<TaskId, VaultError> {
        let _family = self.lock_family(family).await;
        self.start_locked(family, uid, encrypted_input).await
    }

    /// One status round trip.
    ///
    /// # Errors
    /// Returns `VaultError::Network` if the call fails.
    pub async fn poll_status(
        &self,
        family: TaskFamily,
        task_id: &TaskId,
        uid: &Uid,
    ) -> Result<PolledStatus, VaultError> {
        let report = self.service.task_status(family, task_id, uid).await?;
        let class = report.class(self.policy);
        tracing::debug!(
            "{family} status {:?} -> {class:?}",
            report.status.as_deref().unwrap_or("<missing>")
        );
        Ok(PolledStatus { class, report })
    }

    /// Poll until the task is done, then fetch its result body.
    ///
    /// Waits `interval` between polls with no overall timeout. When `cancel`
    /// completes first the task ID stays cached for [`Self::resume`].
    ///
    /// # Errors
    /// Returns `TaskError::MustRestart` as soon as a poll says so (no result
    /// fetch is made), `TaskError::Cancelled` on cancellation, and
    /// non-transport network errors as they occur.
    pub async fn fetch_result<F>(
        &self,
        family: TaskFamily,
        task_id: &TaskId,
        uid: &Uid,
        interval: Duration,
        cancel: F,
    ) -> Result<Vec<u8>, VaultError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let mut polls: u64 = 0;
        loop {
            polls += 1;
            let step = tokio::select! {
                biased;
                () = &mut cancel => return Err(self.cancelled(family)),
                step = self.poll_step(family, task_id, uid) => step,
            };

            match step {
                Ok(Step::Ready(body)) => {
                    tracing::info!("{family} result fetched after {polls} polls ({} bytes)", body.len());
                    self.forget_task(family, task_id)?;
                    return Ok(body);
                }
                Ok(Step::Wait) => {}
                Err(e) => {
                    if matches!(e, VaultError::Task(TaskError::MustRestart { .. })) {
                        self.forget_task(family, task_id)?;
                    }
                    return Err(e);
                }
            }

            tokio::select! {
                biased;
                () = &mut cancel => return Err(self.cancelled(family)),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Upload if needed, start a task on `input` and wait for its result.
    ///
    /// # Errors
    /// See [`Self::fetch_result`].
    pub async fn run_task<F>(
        &self,
        family: TaskFamily,
        key: &ComputeKey,
        input: Vec<u8>,
        cancel: F,
    ) -> Result<Vec<u8>, VaultError>
    where
        F: Future<Output = ()>,
    {
        let (uid, task_id) = {
            let _family = self.lock_family(family).await;
            let uid = self.upload_locked(family, key).await?;
            let task_id = self.start_locked(family, &uid, input).await?;
            (uid, task_id)
        };
        self.fetch_result(family, &task_id, &uid, self.poll_interval(family), cancel)
            .await
    }

    /// Resume polling the task cached for `family`.
    ///
    /// # Errors
    /// Returns `TaskError::NotStarted` if no task is cached, otherwise see
    /// [`Self::fetch_result`].
    pub async fn resume<F>(&self, family: TaskFamily, cancel: F) -> Result<Vec<u8>, VaultError>
    where
        F: Future<Output = ()>,
    {
        let entry = self.ledger_entry(family)?;
        let (Some(uid), Some(task_id)) = (entry.uid, entry.task_id) else {
            return Err(TaskError::NotStarted(family).into());
        };
        tracing::info!("Resuming {family} task");
        self.fetch_result(family, &task_id, &uid, self.poll_interval(family), cancel)
            .await
    }

    async fn lock_family(&self, family: TaskFamily) -> tokio::sync::MutexGuard<'_, ()> {
        self.families[family as usize].lock().await
    }

    async fn upload_locked(&self, family: TaskFamily, key: &ComputeKey) -> Result<Uid, VaultError> {
        let entry = self.ledger_entry(family)?;
        if let (Some(uid), Some(fingerprint)) = (entry.uid, entry.key_fingerprint.as_deref()) {
            if fingerprint == key.fingerprint() {
                tracing::debug!("Reusing uploaded compute key for {family}");
                return Ok(uid);
            }
            tracing::info!(
                "Compute key changed ({fingerprint} -> {}), uploading again",
                key.fingerprint()
            );
        }

        let bytes = key.to_bytes()?;
        tracing::info!("Uploading compute key for {family} ({} bytes)", bytes.len());
        let uid = self.service.add_key(family, bytes).await?;

        let fingerprint = key.fingerprint().to_string();
        self.update_ledger(family, |entry| {
            entry.uid = Some(uid.clone());
            entry.key_fingerprint = Some(fingerprint);
            // A task started under another UID cannot be polled with this one.
            entry.task_id = None;
        })?;
        Ok(uid)
    }

    async fn start_locked(
        &self,
        family: TaskFamily,
        uid: &Uid,
        encrypted_input: Vec<u8>,
    ) -> Result<TaskId, VaultError> {
        let size = encrypted_input.len();
        let task_id = self.service.start_task(family, uid, encrypted_input).await?;

        let mut superseded = false;
        self.update_ledger(family, |entry| {
            superseded = entry.task_id.is_some();
            entry.task_id = Some(task_id.clone());
        })?;
        if superseded {
            tracing::info!("Started {family} task ({size} bytes), superseding the cached one");
        } else {
            tracing::info!("Started {family} task ({size} bytes)");
        }
        Ok(task_id)
    }

    async fn poll_step(
        &self,
        family: TaskFamily,
        task_id: &TaskId,
        uid: &Uid,
    ) -> Result<Step, VaultError> {
        let polled = match self.poll_status(family, task_id, uid).await {
            Ok(polled) => polled,
            Err(VaultError::Network(e)) if e.is_transport() => {
                tracing::warn!("{family} status poll failed, retrying: {e}");
                return Ok(Step::Wait);
            }
            Err(e) => return Err(e),
        };

        match polled.class {
            StatusClass::Wait => return Ok(Step::Wait),
            StatusClass::Restart => {
                let status = polled.report.status.unwrap_or_else(|| "<missing>".to_string());
                if let Some(details) = polled.report.details.as_deref() {
                    tracing::warn!("{family} task failed ({status}): {details}");
                }
                return Err(TaskError::MustRestart { family, status }.into());
            }
            StatusClass::Done => {}
        }

        let body = match self.service.task_result(family, task_id, uid).await {
            Ok(body) => body,
            Err(e) if e.is_transport() => {
                tracing::warn!("{family} result fetch failed, retrying: {e}");
                return Ok(Step::Wait);
            }
            Err(e) => return Err(e.into()),
        };

        match classify_body(&body, self.policy) {
            StatusClass::Done => Ok(Step::Ready(body)),
            StatusClass::Wait => Ok(Step::Wait),
            StatusClass::Restart => Err(TaskError::MustRestart {
                family,
                status: body_status(&body).map_or_else(|| "<missing>".to_string(), |s| s.to_string()),
            }
            .into()),
        }
    }

    fn cancelled(&self, family: TaskFamily) -> VaultError {
        tracing::info!("Polling {family} cancelled; task ID kept for resume");
        TaskError::Cancelled(family).into()
    }

    fn forget_task(&self, family: TaskFamily, task_id: &TaskId) -> Result<(), VaultError> {
        self.update_ledger(family, |entry| {
            if entry.task_id.as_ref() == Some(task_id) {
                entry.task_id = None;
            }
        })
    }

    fn read_ledger(&self) -> Result<Ledger, VaultError> {
        let Some(bytes) = self.store.read(VaultFile::TaskLedger, None).map_err(storage)? else {
            return Ok(Ledger::default());
        };
        match serde_json::from_slice(&bytes) {
            Ok(ledger) => Ok(ledger),
            Err(e) => {
                tracing::warn!("Task ledger unreadable ({e}); starting from an empty one");
                Ok(Ledger::default())
            }
        }
    }

    fn update_ledger(
        &self,
        family: TaskFamily,
        update: impl FnOnce(&mut LedgerEntry),
    ) -> Result<(), VaultError> {
        let _held = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ledger = self.read_ledger()?;
        update(ledger.families.entry(family).or_default());
        let bytes = serde_json::to_vec_pretty(&ledger)?;
        self.store
            .write(VaultFile::TaskLedger, None, Some(&bytes))
            .map_err(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_json_shape() {
        let mut ledger = Ledger::default();
        ledger.families.insert(
            TaskFamily::SleepQuality,
            LedgerEntry {
                uid: Some(Uid("u".into())),
                key_fingerprint: Some("00ff".into()),
                task_id: None,
            },
        );
        let json = serde_json::to_string(&ledger).expect("encode");
        assert_eq!(
            json,
            r#"{"families":{"sleep_quality":{"uid":"u","key_fingerprint":"00ff"}}}"#
        );
        let back: Ledger = serde_json::from_str(&json).expect("decode");
        assert_eq!(back.families[&TaskFamily::SleepQuality].uid, Some(Uid("u".into())));
    }

    #[test]
    fn test_error_messages() {
        let err = TaskError::MustRestart {
            family: TaskFamily::WeightStats,
            status: "revoked".into(),
        };
        assert_eq!(
            err.to_string(),
            "Task for weight_stats must be restarted (status: revoked)"
        );
        assert_eq!(
            TaskError::NotStarted(TaskFamily::AdTargeting).to_string(),
            "No task started for ad_targeting"
        );
    }
}
