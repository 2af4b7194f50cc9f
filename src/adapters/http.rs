//! HTTP adapter: implementation of `ComputeService` over reqwest.
//!
//! Uploads are multipart POSTs, polls are query-string GETs. Any response
//! other than 200 fails the call with `InvalidHttpCode`; interpreting the
//! body's status is left to the orchestrator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;

use crate::domain::{StatusReport, TaskFamily, TaskId, Uid};
use crate::ports::{ComputeService, NetworkError};

/// Default per-request timeout; compute key uploads are tens of MB.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// `ComputeService` backed by a remote HTTP server.
#[derive(Debug, Clone)]
pub struct HttpComputeService {
    client: Client,
    root: String,
}

#[derive(Deserialize)]
struct AddKeyResponse {
    uid: String,
}

#[derive(Deserialize)]
struct StartTaskResponse {
    task_id: String,
}

fn transport(e: reqwest::Error) -> NetworkError {
    NetworkError::Transport(e.to_string())
}

impl HttpComputeService {
    /// Create a client for the service rooted at `root` (e.g. `https://host/api`).
    ///
    /// # Errors
    /// Returns `NetworkError::Message` if the HTTP client cannot be built.
    pub fn new(root: impl Into<String>, timeout: Duration) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::Message(format!("Failed to build HTTP client: {e}")))?;
        let root = root.into().trim_end_matches('/').to_string();
        tracing::info!("Compute service at {root} (timeout {}s)", timeout.as_secs());
        Ok(Self { client, root })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.root)
    }

    async fn send(&self, request: RequestBuilder, endpoint: &str) -> Result<Vec<u8>, NetworkError> {
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if status != StatusCode::OK {
            tracing::warn!("{endpoint} failed with HTTP {}", status.as_u16());
            return Err(NetworkError::InvalidHttpCode(status.as_u16()));
        }
        let body = response.bytes().await.map_err(transport)?;
        tracing::debug!("{endpoint} OK ({} bytes)", body.len());
        Ok(body.to_vec())
    }

    fn query<'a>(family: TaskFamily, task_id: &'a TaskId, uid: &'a Uid) -> [(&'static str, &'a str); 3] {
        [
            ("task_name", family.name()),
            ("task_id", task_id.0.as_str()),
            ("uid", uid.0.as_str()),
        ]
    }
}

fn parse_json<'de, T: Deserialize<'de>>(body: &'de [u8], endpoint: &str) -> Result<T, NetworkError> {
    serde_json::from_slice(body)
        .map_err(|e| NetworkError::ResultParsing(format!("{endpoint}: {e}")))
}

#[async_trait]
impl ComputeService for HttpComputeService {
    async fn add_key(&self, family: TaskFamily, key: Vec<u8>) -> Result<Uid, NetworkError> {
        let size = key.len();
        let form = Form::new()
            .text("task_name", family.name())
            .part("key", Part::bytes(key).file_name("key"));
        let body = self
            .send(self.client.post(self.url("add_key")).multipart(form), "add_key")
            .await?;
        let parsed: AddKeyResponse = parse_json(&body, "add_key")?;
        tracing::info!("Uploaded compute key for {family} ({size} bytes)");
        Ok(Uid(parsed.uid))
    }

    async fn start_task(
        &self,
        family: TaskFamily,
        uid: &Uid,
        encrypted_input: Vec<u8>,
    ) -> Result<TaskId, NetworkError> {
        let form = Form::new()
            .text("task_name", family.name())
            .text("uid", uid.0.clone())
            .part(
                "encrypted_input",
                Part::bytes(encrypted_input).file_name("encrypted_input"),
            );
        let body = self
            .send(self.client.post(self.url("start_task")).multipart(form), "start_task")
            .await?;
        let parsed: StartTaskResponse = parse_json(&body, "start_task")?;
        Ok(TaskId(parsed.task_id))
    }

    async fn task_status(
        &self,
        family: TaskFamily,
        task_id: &TaskId,
        uid: &Uid,
    ) -> Result<StatusReport, NetworkError> {
        let request = self
            .client
            .get(self.url("get_task_status"))
            .query(&Self::query(family, task_id, uid));
        let body = self.send(request, "get_task_status").await?;
        parse_json(&body, "get_task_status")
    }

    async fn task_result(
        &self,
        family: TaskFamily,
        task_id: &TaskId,
        uid: &Uid,
    ) -> Result<Vec<u8>, NetworkError> {
        let request = self
            .client
            .get(self.url("get_task_result"))
            .query(&Self::query(family, task_id, uid));
        self.send(request, "get_task_result").await
    }
}
