//! Task life cycle against a scripted compute service.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{keys, ScriptedService};
use datavault::adapters::fs_store::FsBlobStore;
use datavault::adapters::tfhe::ComputeKey;
use datavault::application::TaskOrchestrator;
use datavault::domain::{MissingStatusPolicy, StatusReport, TaskFamily};
use datavault::ports::NetworkError;
use datavault::{TaskError, VaultError};

const FAMILY: TaskFamily = TaskFamily::SleepQuality;

fn setup() -> (TempDir, Arc<ScriptedService>, TaskOrchestrator<ScriptedService, FsBlobStore>) {
    let dir = TempDir::new().expect("tempdir");
    let service = Arc::new(ScriptedService::new());
    let store = Arc::new(FsBlobStore::new(dir.path()));
    let orchestrator = TaskOrchestrator::new(Arc::clone(&service), store)
        .with_poll_interval(Duration::from_millis(1));
    (dir, service, orchestrator)
}

fn never() -> std::future::Pending<()> {
    std::future::pending()
}

#[tokio::test]
async fn test_success_after_waiting() {
    let (_dir, service, orchestrator) = setup();
    service.push_status("queued");
    service.push_status("started");
    service.push_status("success");
    service.set_result(b"\x01\x02ciphertext");

    let body = orchestrator
        .run_task(FAMILY, &keys().compute, b"input".to_vec(), never())
        .await
        .expect("run_task");

    assert_eq!(body, b"\x01\x02ciphertext");
    assert_eq!(service.count("task_status"), 3);
    assert_eq!(service.count("task_result"), 1);

    let entry = orchestrator.ledger_entry(FAMILY).expect("ledger");
    assert!(entry.uid.is_some());
    assert_eq!(entry.task_id, None);
}

#[tokio::test]
async fn test_failure_statuses_never_fetch_a_result() {
    for status in ["failure", "revoked", "unknown", "error", "pending", "weird"] {
        let (_dir, service, orchestrator) = setup();
        service.push_status("started");
        service.push_status(status);

        let err = orchestrator
            .run_task(FAMILY, &keys().compute, b"input".to_vec(), never())
            .await
            .expect_err(status);

        assert!(
            matches!(err, VaultError::Task(TaskError::MustRestart { .. })),
            "{status}: {err}"
        );
        assert_eq!(service.count("task_result"), 0, "{status}");
        assert_eq!(orchestrator.ledger_entry(FAMILY).expect("ledger").task_id, None);
    }
}

#[tokio::test]
async fn test_failed_result_body_is_a_restart() {
    let (_dir, service, orchestrator) = setup();
    service.push_status("success");
    service.set_result(br#"{"status":"revoked"}"#);

    let err = orchestrator
        .run_task(FAMILY, &keys().compute, b"input".to_vec(), never())
        .await
        .expect_err("revoked body");
    match err {
        VaultError::Task(TaskError::MustRestart { status, .. }) => assert_eq!(status, "revoked"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_transport_errors_are_retried() {
    let (_dir, service, orchestrator) = setup();
    service.push_error(NetworkError::Transport("connection reset".into()));
    service.push_error(NetworkError::Transport("timed out".into()));
    service.push_status("success");
    service.set_result(b"ok");

    let body = orchestrator
        .run_task(FAMILY, &keys().compute, b"input".to_vec(), never())
        .await
        .expect("run_task");
    assert_eq!(body, b"ok");
    assert_eq!(service.count("task_status"), 3);
}

#[tokio::test]
async fn test_http_errors_propagate() {
    let (_dir, service, orchestrator) = setup();
    service.push_error(NetworkError::InvalidHttpCode(500));

    let err = orchestrator
        .run_task(FAMILY, &keys().compute, b"input".to_vec(), never())
        .await
        .expect_err("500");
    assert!(matches!(err, VaultError::Network(NetworkError::InvalidHttpCode(500))));
    // Not a restart: the task can still be resumed.
    assert!(orchestrator.ledger_entry(FAMILY).expect("ledger").task_id.is_some());
}

#[tokio::test]
async fn test_missing_status_policy() {
    let (_dir, service, orchestrator) = setup();
    service.push_report(StatusReport::default());
    service.set_result(b"raw");
    let body = orchestrator
        .run_task(FAMILY, &keys().compute, b"input".to_vec(), never())
        .await
        .expect("assume done");
    assert_eq!(body, b"raw");

    let (_dir, service, orchestrator) = setup();
    let orchestrator = orchestrator.with_missing_status_policy(MissingStatusPolicy::Restart);
    service.push_report(StatusReport::default());
    let err = orchestrator
        .run_task(FAMILY, &keys().compute, b"input".to_vec(), never())
        .await
        .expect_err("restart");
    assert!(matches!(err, VaultError::Task(TaskError::MustRestart { .. })));
    assert_eq!(service.count("task_result"), 0);
}

#[tokio::test]
async fn test_cancel_keeps_task_for_resume() {
    let (_dir, service, orchestrator) = setup();

    let err = orchestrator
        .run_task(
            FAMILY,
            &keys().compute,
            b"input".to_vec(),
            tokio::time::sleep(Duration::from_millis(30)),
        )
        .await
        .expect_err("cancelled");
    assert!(matches!(err, VaultError::Task(TaskError::Cancelled(FAMILY))));

    let entry = orchestrator.ledger_entry(FAMILY).expect("ledger");
    assert!(entry.task_id.is_some(), "task kept");

    service.push_status("completed");
    service.set_result(b"late");
    let body = orchestrator.resume(FAMILY, never()).await.expect("resume");
    assert_eq!(body, b"late");
    assert_eq!(service.count("start_task"), 1);
    assert_eq!(service.count("add_key"), 1);

    assert_eq!(orchestrator.ledger_entry(FAMILY).expect("ledger").task_id, None);
}

#[tokio::test]
async fn test_resume_without_task() {
    let (_dir, _service, orchestrator) = setup();
    let err = orchestrator.resume(FAMILY, never()).await.expect_err("nothing cached");
    assert!(matches!(err, VaultError::Task(TaskError::NotStarted(FAMILY))));
}

#[tokio::test]
async fn test_uid_reused_until_key_changes() {
    let (_dir, service, orchestrator) = setup();
    let compute = &keys().compute;

    let first = orchestrator
        .upload_compute_key_if_needed(FAMILY, compute)
        .await
        .expect("upload");
    let again = orchestrator
        .upload_compute_key_if_needed(FAMILY, compute)
        .await
        .expect("cached");
    assert_eq!(first, again);
    assert_eq!(service.count("add_key"), 1);

    // Families keep separate UIDs.
    orchestrator
        .upload_compute_key_if_needed(TaskFamily::WeightStats, compute)
        .await
        .expect("other family");
    assert_eq!(service.count("add_key"), 2);

    orchestrator
        .start_task(FAMILY, &first, b"input".to_vec())
        .await
        .expect("start");
    assert!(orchestrator.ledger_entry(FAMILY).expect("ledger").task_id.is_some());

    let rotated = ComputeKey::derive(&keys().private).expect("derive");
    assert_ne!(rotated.fingerprint(), compute.fingerprint());
    let second = orchestrator
        .upload_compute_key_if_needed(FAMILY, &rotated)
        .await
        .expect("re-upload");
    assert_ne!(first, second);
    assert_eq!(service.count("add_key"), 3);

    let entry = orchestrator.ledger_entry(FAMILY).expect("ledger");
    assert_eq!(entry.uid, Some(second));
    assert_eq!(entry.key_fingerprint.as_deref(), Some(rotated.fingerprint()));
    assert_eq!(entry.task_id, None);
}

#[tokio::test]
async fn test_ledger_survives_a_new_orchestrator() {
    let dir = TempDir::new().expect("tempdir");
    let service = Arc::new(ScriptedService::new());
    let store = Arc::new(FsBlobStore::new(dir.path()));

    let first = TaskOrchestrator::new(Arc::clone(&service), Arc::clone(&store));
    let uid = first
        .upload_compute_key_if_needed(FAMILY, &keys().compute)
        .await
        .expect("upload");
    first.start_task(FAMILY, &uid, b"x".to_vec()).await.expect("start");

    let second = TaskOrchestrator::new(Arc::clone(&service), store);
    assert_eq!(
        second.ledger_entry(FAMILY).expect("ledger"),
        first.ledger_entry(FAMILY).expect("ledger")
    );
    second
        .upload_compute_key_if_needed(FAMILY, &keys().compute)
        .await
        .expect("cached");
    assert_eq!(service.count("add_key"), 1);

    second.forget(FAMILY).await.expect("forget");
    assert_eq!(second.ledger_entry(FAMILY).expect("ledger"), Default::default());
}
