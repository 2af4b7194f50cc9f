//! In-process adapter: implementation of `ComputeService` without a network.
//!
//! Keys uploaded through `add_key` are kept per UID; each started task runs
//! on the blocking pool through a [`ComputeWorker`] and reports the same
//! statuses and bodies the remote service does. Families without a local
//! kernel fail with status `failure`.
//!
//! A settled task is forgotten once its result has been fetched; asking for
//! it again reports `unknown`. Keys stay registered so their UID can be
//! reused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::adapters::tfhe::ComputeKey;
use crate::application::ComputeWorker;
use crate::domain::{Persist, StatusReport, TaskFamily, TaskId, Uid};
use crate::ports::{ComputeService, NetworkError};

#[derive(Debug, Clone)]
enum TaskState {
    Started,
    Succeeded(Vec<u8>),
    Failed(String),
}

#[derive(Debug)]
struct TaskRecord {
    family: TaskFamily,
    uid: Uid,
    state: TaskState,
}

#[derive(Debug, Default)]
struct Registry {
    keys: HashMap<Uid, Arc<ComputeKey>>,
    tasks: HashMap<TaskId, TaskRecord>,
}

/// `ComputeService` that computes in the current process.
#[derive(Debug, Clone, Default)]
pub struct LocalComputeService {
    worker: Arc<ComputeWorker>,
    registry: Arc<Mutex<Registry>>,
}

/// Random identifier in the 8-4-4-4-12 hex layout the remote service uses.
fn random_id() -> String {
    let bytes: [u8; 16] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    )
}

impl LocalComputeService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, task_id: &TaskId, state: TaskState) {
        if let Some(record) = self.registry().tasks.get_mut(task_id) {
            record.state = state;
        }
    }

    fn record_state(&self, family: TaskFamily, task_id: &TaskId, uid: &Uid) -> Option<TaskState> {
        self.registry()
            .tasks
            .get(task_id)
            .filter(|r| r.family == family && &r.uid == uid)
            .map(|r| r.state.clone())
    }

    /// Like `record_state`, but removes the record once it has settled.
    fn take_state(&self, family: TaskFamily, task_id: &TaskId, uid: &Uid) -> Option<TaskState> {
        let mut registry = self.registry();
        let record = registry
            .tasks
            .get(task_id)
            .filter(|r| r.family == family && &r.uid == uid)?;
        if matches!(record.state, TaskState::Started) {
            return Some(TaskState::Started);
        }
        registry.tasks.remove(task_id).map(|r| r.state)
    }
}

fn status_body(status: &str, details: Option<String>) -> Result<Vec<u8>, NetworkError> {
    serde_json::to_vec(&StatusReport {
        status: Some(status.to_string()),
        details,
    })
    .map_err(|e| NetworkError::Message(e.to_string()))
}

#[async_trait]
impl ComputeService for LocalComputeService {
    async fn add_key(&self, family: TaskFamily, key: Vec<u8>) -> Result<Uid, NetworkError> {
        let key = ComputeKey::from_bytes((), &key)
            .map_err(|e| NetworkError::Message(format!("add_key rejected: {e}")))?;
        let uid = Uid(random_id());
        tracing::info!("Registered compute key {} for {family}", key.fingerprint());
        self.registry().keys.insert(uid.clone(), Arc::new(key));
        Ok(uid)
    }

    async fn start_task(
        &self,
        family: TaskFamily,
        uid: &Uid,
        encrypted_input: Vec<u8>,
    ) -> Result<TaskId, NetworkError> {
        let key = self
            .registry()
            .keys
            .get(uid)
            .cloned()
            .ok_or(NetworkError::InvalidHttpCode(404))?;

        let task_id = TaskId(random_id());
        self.registry().tasks.insert(
            task_id.clone(),
            TaskRecord {
                family,
                uid: uid.clone(),
                state: TaskState::Started,
            },
        );

        let this = self.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            let worker = Arc::clone(&this.worker);
            let outcome = tokio::task::spawn_blocking(move || {
                worker.run(family, &key, &encrypted_input)
            })
            .await;
            let state = match outcome {
                Ok(Ok(body)) => TaskState::Succeeded(body),
                Ok(Err(e)) => {
                    tracing::warn!("{family} failed: {e}");
                    TaskState::Failed(e.to_string())
                }
                Err(e) => TaskState::Failed(format!("worker panicked: {e}")),
            };
            this.finish(&id, state);
        });

        tracing::debug!("Started {family} task");
        Ok(task_id)
    }

    async fn task_status(
        &self,
        family: TaskFamily,
        task_id: &TaskId,
        uid: &Uid,
    ) -> Result<StatusReport, NetworkError> {
        Ok(match self.record_state(family, task_id, uid) {
            None => StatusReport::new("unknown"),
            Some(TaskState::Started) => StatusReport::new("started"),
            Some(TaskState::Succeeded(_)) => StatusReport::new("success"),
            Some(TaskState::Failed(details)) => StatusReport {
                status: Some("failure".to_string()),
                details: Some(details),
            },
        })
    }

    async fn task_result(
        &self,
        family: TaskFamily,
        task_id: &TaskId,
        uid: &Uid,
    ) -> Result<Vec<u8>, NetworkError> {
        match self.take_state(family, task_id, uid) {
            None => status_body("unknown", None),
            Some(TaskState::Started) => status_body("started", None),
            Some(TaskState::Succeeded(body)) => Ok(body),
            Some(TaskState::Failed(details)) => status_body("failure", Some(details)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::tfhe::{test_keys, CompactBatch};
    use crate::domain::{classify_body, MissingStatusPolicy, StatusClass};

    async fn wait_until_settled(
        service: &LocalComputeService,
        family: TaskFamily,
        task: &TaskId,
        uid: &Uid,
    ) -> StatusReport {
        loop {
            let report = service.task_status(family, task, uid).await.expect("status");
            if report.status.as_deref() != Some("started") {
                return report;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_random_ids_look_like_uuids() {
        let id = random_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
        assert_ne!(id, random_id());
    }

    #[tokio::test]
    async fn test_weight_stats_runs_locally() {
        let keys = test_keys::get();
        let service = LocalComputeService::new();
        let uid = service
            .add_key(TaskFamily::WeightStats, keys.compute.to_bytes().expect("key"))
            .await
            .expect("add_key");

        let input = CompactBatch::build_u16(&[700, 710], &keys.public)
            .expect("build")
            .to_bytes()
            .expect("serialize");
        let task = service
            .start_task(TaskFamily::WeightStats, &uid, input)
            .await
            .expect("start");

        let report = wait_until_settled(&service, TaskFamily::WeightStats, &task, &uid).await;
        assert_eq!(report.status.as_deref(), Some("success"));

        let body = service
            .task_result(TaskFamily::WeightStats, &task, &uid)
            .await
            .expect("result");
        assert_eq!(classify_body(&body, MissingStatusPolicy::Restart), StatusClass::Done);
    }

    #[tokio::test]
    async fn test_fetched_task_is_forgotten() {
        let keys = test_keys::get();
        let service = LocalComputeService::new();
        let uid = service
            .add_key(TaskFamily::SleepQuality, keys.compute.to_bytes().expect("key"))
            .await
            .expect("add_key");
        let task = service
            .start_task(TaskFamily::SleepQuality, &uid, vec![1, 2, 3])
            .await
            .expect("start");
        wait_until_settled(&service, TaskFamily::SleepQuality, &task, &uid).await;

        let body = service
            .task_result(TaskFamily::SleepQuality, &task, &uid)
            .await
            .expect("result");
        assert_eq!(classify_body(&body, MissingStatusPolicy::Restart), StatusClass::Restart);
        assert!(service.registry().tasks.is_empty());
        assert_eq!(service.registry().keys.len(), 1);

        let report = service
            .task_status(TaskFamily::SleepQuality, &task, &uid)
            .await
            .expect("status");
        assert_eq!(report.status.as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn test_result_of_running_task_keeps_record() {
        let service = LocalComputeService::new();
        let task = TaskId("running".into());
        let uid = Uid("u".into());
        service.registry().tasks.insert(
            task.clone(),
            TaskRecord {
                family: TaskFamily::WeightStats,
                uid: uid.clone(),
                state: TaskState::Started,
            },
        );

        let body = service
            .task_result(TaskFamily::WeightStats, &task, &uid)
            .await
            .expect("result");
        assert_eq!(classify_body(&body, MissingStatusPolicy::Restart), StatusClass::Wait);
        assert_eq!(service.registry().tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_family_fails_task() {
        let keys = test_keys::get();
        let service = LocalComputeService::new();
        let uid = service
            .add_key(TaskFamily::SleepQuality, keys.compute.to_bytes().expect("key"))
            .await
            .expect("add_key");
        let task = service
            .start_task(TaskFamily::SleepQuality, &uid, vec![1, 2, 3])
            .await
            .expect("start");

        let report = wait_until_settled(&service, TaskFamily::SleepQuality, &task, &uid).await;
        assert_eq!(report.status.as_deref(), Some("failure"));
        assert!(report.details.is_some());
    }

    #[tokio::test]
    async fn test_unknown_uid_and_task() {
        let service = LocalComputeService::new();
        let err = service
            .start_task(TaskFamily::WeightStats, &Uid("nope".into()), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::InvalidHttpCode(404)));

        let report = service
            .task_status(TaskFamily::WeightStats, &TaskId("t".into()), &Uid("u".into()))
            .await
            .expect("status");
        assert_eq!(report.status.as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn test_garbage_key_rejected() {
        let err = LocalComputeService::new()
            .add_key(TaskFamily::WeightStats, b"garbage".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Message(_)));
    }
}
