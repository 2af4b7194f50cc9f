//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;

use datavault::adapters::tfhe::{ComputeKey, PrivateKey, PublicKey};
use datavault::domain::{StatusReport, TaskFamily, TaskId, Uid};
use datavault::ports::{ComputeService, NetworkError};

pub struct TestKeys {
    pub private: PrivateKey,
    pub public: PublicKey,
    pub compute: ComputeKey,
}

/// One key set per test binary; key generation takes seconds.
pub fn keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let private = PrivateKey::generate().expect("generate private key");
        let public = PublicKey::derive(&private).expect("derive public key");
        let compute = ComputeKey::derive(&private).expect("derive compute key");
        TestKeys {
            private,
            public,
            compute,
        }
    })
}

/// Compute service that replays a scripted sequence of status replies.
///
/// Once the script runs out every poll answers `started`.
#[derive(Default)]
pub struct ScriptedService {
    statuses: Mutex<VecDeque<Result<StatusReport, NetworkError>>>,
    result: Mutex<Vec<u8>>,
    calls: Mutex<Vec<String>>,
    counter: Mutex<u32>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, status: &str) {
        self.statuses
            .lock()
            .unwrap()
            .push_back(Ok(StatusReport::new(status)));
    }

    pub fn push_report(&self, report: StatusReport) {
        self.statuses.lock().unwrap().push_back(Ok(report));
    }

    pub fn push_error(&self, error: NetworkError) {
        self.statuses.lock().unwrap().push_back(Err(error));
    }

    pub fn set_result(&self, body: &[u8]) {
        *self.result.lock().unwrap() = body.to_vec();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: &str) -> u32 {
        self.calls.lock().unwrap().push(call.to_string());
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        *counter
    }
}

#[async_trait]
impl ComputeService for ScriptedService {
    async fn add_key(&self, _family: TaskFamily, key: Vec<u8>) -> Result<Uid, NetworkError> {
        assert!(!key.is_empty());
        let n = self.record("add_key");
        Ok(Uid(format!("uid-{n}")))
    }

    async fn start_task(
        &self,
        _family: TaskFamily,
        uid: &Uid,
        _encrypted_input: Vec<u8>,
    ) -> Result<TaskId, NetworkError> {
        assert!(uid.0.starts_with("uid-"));
        let n = self.record("start_task");
        Ok(TaskId(format!("task-{n}")))
    }

    async fn task_status(
        &self,
        _family: TaskFamily,
        _task_id: &TaskId,
        _uid: &Uid,
    ) -> Result<StatusReport, NetworkError> {
        self.record("task_status");
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(StatusReport::new("started")))
    }

    async fn task_result(
        &self,
        _family: TaskFamily,
        _task_id: &TaskId,
        _uid: &Uid,
    ) -> Result<Vec<u8>, NetworkError> {
        self.record("task_result");
        Ok(self.result.lock().unwrap().clone())
    }
}
