//! Orchestrator end-to-end tests over the local blob store, the in-memory job
//! store and `sh` scripts standing in for the converter.
//!
//! Run with: cargo test --test orchestrator_test
#![cfg(unix)]

mod fixtures;
mod helpers;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fixtures::*;
use helpers::*;
use manuscript_convert::models::job::{
    BlobRef, ConversionJob, ErrorKind, JobStatus, Transition, TransitionOutcome,
};
use manuscript_convert::models::progress::{ProgressKind, ProgressPayload};
use manuscript_convert::models::submission::SubmitRequest;
use manuscript_convert::services::orchestrator::OrchestratorError;
use manuscript_convert::services::state_machine::{JobRepository, RepositoryError, StateError};
use manuscript_convert::services::storage::{BlobReader, BlobStore, StorageError, StoredBlob};
use tokio::io::AsyncRead;
use uuid::Uuid;

/// Fails the third `put`: the input, then `a.xml`, then `b.json` for
/// `TWO_OUTPUTS`.
struct FailThirdPut {
    inner: Arc<dyn BlobStore>,
    puts: AtomicUsize,
}

fn fail_third_put(inner: Arc<dyn BlobStore>) -> Arc<dyn BlobStore> {
    Arc::new(FailThirdPut {
        inner,
        puts: AtomicUsize::new(0),
    })
}

#[async_trait]
impl BlobStore for FailThirdPut {
    async fn put(
        &self,
        name: &str,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<StoredBlob, StorageError> {
        if self.puts.fetch_add(1, Ordering::SeqCst) == 2 {
            return Err(StorageError::Io(std::io::Error::other("bucket unavailable")));
        }
        self.inner.put(name, content).await
    }

    async fn get(&self, blob: &BlobRef) -> Result<BlobReader, StorageError> {
        self.inner.get(blob).await
    }

    async fn delete(&self, blob: &BlobRef) -> Result<(), StorageError> {
        self.inner.delete(blob).await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.inner.health_check().await
    }

    async fn materialize_to_local(&self, blob: &BlobRef, path: &Path) -> Result<u64, StorageError> {
        self.inner.materialize_to_local(blob, path).await
    }
}

/// Job repository with hooks around `transition` and `delete`.
struct HookedRepository {
    inner: Arc<dyn JobRepository>,
    /// Number of `Start` transitions to reject with a database error.
    failing_starts: AtomicUsize,
    /// Hold `delete` until the record has reached a terminal status.
    delete_after_finish: bool,
}

fn flaky_start(inner: Arc<dyn JobRepository>) -> Arc<dyn JobRepository> {
    Arc::new(HookedRepository {
        inner,
        failing_starts: AtomicUsize::new(2),
        delete_after_finish: false,
    })
}

fn delete_after_finish(inner: Arc<dyn JobRepository>) -> Arc<dyn JobRepository> {
    Arc::new(HookedRepository {
        inner,
        failing_starts: AtomicUsize::new(0),
        delete_after_finish: true,
    })
}

#[async_trait]
impl JobRepository for HookedRepository {
    async fn insert(&self, job: &ConversionJob) -> Result<(), RepositoryError> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConversionJob>, RepositoryError> {
        self.inner.get(id).await
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RepositoryError> {
        if matches!(transition, Transition::Start)
            && self
                .failing_starts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.transition(id, transition, now).await
    }

    async fn delete(&self, id: Uuid) -> Result<Option<ConversionJob>, RepositoryError> {
        if self.delete_after_finish {
            for _ in 0..250 {
                match self.inner.get(id).await? {
                    Some(job) if !job.status.is_terminal() => tokio::time::sleep(Duration::from_millis(20)).await,
                    _ => break,
                }
            }
        }
        self.inner.delete(id).await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ConversionJob>, RepositoryError> {
        self.inner.list_by_status(status).await
    }

    async fn list_by_owner(&self, owner_ref: &str) -> Result<Vec<ConversionJob>, RepositoryError> {
        self.inner.list_by_owner(owner_ref).await
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn test_two_outputs_are_recorded_with_sizes() {
    let h = harness(TWO_OUTPUTS.script).await;
    let job = h.run("thesis.pdf", b"%PDF-1.7 manuscript").await;

    assert_eq!(job.status, JobStatus::Completed);
    let outputs: Vec<_> = job.outputs.iter().map(|o| (o.name.as_str(), o.size)).collect();
    assert_eq!(outputs, TWO_OUTPUTS.expected_outputs.to_vec());
    assert_eq!(job.outputs[1].content_type, "application/json");
    assert_eq!(h.read_blob(&job.outputs[0].blob).await, b"<a/>");

    assert!(job.error.is_none());
    assert!(job.processing_started_at.is_some());
    assert!(job.processing_ended_at >= job.processing_started_at);
    assert!(job.processing_seconds.is_some());
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_epub_scenario() {
    let h = harness(EPUB_PIPELINE.script).await;
    let manuscript = epub_manuscript();

    let submitted = h.submit("book.epub", &manuscript).await;
    assert_eq!(submitted.status, JobStatus::Uploaded);
    assert_eq!(submitted.input.size, 500 * 1024);
    assert_eq!(submitted.input.content_type, "application/epub+zip");

    h.orchestrator.drain().await;
    let job = h.jobs.get(submitted.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    let outputs: Vec<_> = job.outputs.iter().map(|o| (o.name.as_str(), o.size)).collect();
    assert_eq!(outputs, EPUB_PIPELINE.expected_outputs.to_vec());
    assert!(!h.workspace_root.path().join(job.id.to_string()).exists());
}

#[tokio::test]
async fn test_success_without_outputs_fails_with_empty_output() {
    let h = harness(NO_OUTPUT).await;
    let job = h.run("book.pdf", b"pdf").await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::EmptyOutput);
    assert!(job.outputs.is_empty());
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_killed_converter_fails_with_exit_code() {
    let h = harness(KILLED).await;
    let job = h.run("book.pdf", b"pdf").await;

    let error = job.error.expect("failed job carries an error");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(error.kind, ErrorKind::ConversionFailed);
    assert!(error.message.contains("137"), "message: {}", error.message);
    assert!(error.message.contains("out of memory"));
    assert!(!error.message.contains(&h.workspace_root.path().display().to_string()));
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_missing_converter_is_spawn_failure() {
    let runner = manuscript_convert::services::converter::ConverterRunner::new(
        "/nonexistent/integrated-pipelines",
        vec![],
    );
    let h = harness_with(runner, HarnessOptions::default()).await;
    let job = h.run("book.epub", b"epub").await;

    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::SpawnFailure);
    assert!(!error.message.contains("/nonexistent"));
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_timeout_kills_converter() {
    let h = harness_with(
        sh_converter(SLOW),
        HarnessOptions {
            timeout: Duration::from_millis(300),
            ..HarnessOptions::default()
        },
    )
    .await;

    let started = std::time::Instant::now();
    let job = h.run("book.pdf", b"pdf").await;

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::TimedOut);
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let h = harness(SLOW).await;
    let job = h.submit("book.pdf", b"pdf").await;
    h.wait_for_status(job.id, JobStatus::Processing).await;

    assert!(h.orchestrator.cancel(job.id));
    h.orchestrator.drain().await;

    let job = h.jobs.get(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(h.workspace_entries(), 0);
    assert!(!h.orchestrator.cancel(job.id));
}

#[tokio::test]
async fn test_cancel_queued_job_never_runs() {
    let h = harness_with(
        sh_converter(SLOW),
        HarnessOptions {
            max_concurrent_runs: 1,
            ..HarnessOptions::default()
        },
    )
    .await;

    let running = h.submit("first.pdf", b"1").await;
    h.wait_for_status(running.id, JobStatus::Processing).await;
    let queued = h.submit("second.pdf", b"2").await;

    assert!(h.orchestrator.cancel(queued.id));
    assert!(h.orchestrator.cancel(running.id));
    h.orchestrator.drain().await;

    let queued = h.jobs.get(queued.id).await.unwrap();
    assert_eq!(queued.status, JobStatus::Failed);
    assert_eq!(queued.error.unwrap().kind, ErrorKind::Cancelled);
    assert!(queued.processing_started_at.is_none());
}

#[tokio::test]
async fn test_concurrent_jobs_are_isolated() {
    let h = harness(ECHO_INPUT.script).await;

    let (a, b) = futures::future::join(
        h.submit("alpha.pdf", b"alpha manuscript"),
        h.submit("beta.epub", b"beta manuscript, longer"),
    )
    .await;
    h.orchestrator.drain().await;

    let a = h.jobs.get(a.id).await.unwrap();
    let b = h.jobs.get(b.id).await.unwrap();
    assert_eq!(a.status, JobStatus::Completed);
    assert_eq!(b.status, JobStatus::Completed);
    assert_ne!(a.outputs[0].blob, b.outputs[0].blob);
    assert_eq!(h.read_blob(&a.outputs[0].blob).await, b"alpha manuscript");
    assert_eq!(h.read_blob(&b.outputs[0].blob).await, b"beta manuscript, longer");
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_progress_events_follow_converter_order() {
    let h = harness(TWO_OUTPUTS.script).await;
    let job = h.run("book.pdf", b"pdf").await;

    let events = h.transport.for_job(job.id);
    let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            ProgressKind::Started,
            ProgressKind::ProgressText,
            ProgressKind::Percentage,
            ProgressKind::Validation,
            ProgressKind::Percentage,
            ProgressKind::Completed,
        ]
    );
    assert_eq!(events[2].payload, ProgressPayload::Percentage(50.0));
    assert_eq!(events[5].payload, ProgressPayload::Completed { outputs: 2 });
}

#[tokio::test]
async fn test_failure_event_carries_kind() {
    let h = harness(NO_OUTPUT).await;
    let job = h.run("book.pdf", b"pdf").await;

    let last = h.transport.for_job(job.id).pop().unwrap();
    assert!(matches!(
        last.payload,
        ProgressPayload::Failed { error_kind: ErrorKind::EmptyOutput, .. }
    ));
}

#[tokio::test]
async fn test_channel_subscriber_receives_events() {
    let h = harness(SLOW).await;
    let job = h.submit("book.pdf", b"pdf").await;
    let (_subscription, mut rx) = h.orchestrator.relay().subscribe_channel(job.id, 32);

    h.wait_for_status(job.id, JobStatus::Processing).await;
    h.orchestrator.cancel(job.id);
    h.orchestrator.drain().await;

    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.job_id, job.id);
        last = Some(event);
    }
    assert_eq!(last.map(|e| e.kind()), Some(ProgressKind::Failed));
}

#[tokio::test]
async fn test_notifier_sees_terminal_outcomes() {
    let h = harness(TWO_OUTPUTS.script).await;
    let job = h.run("book.pdf", b"pdf").await;

    let outcomes = h.notifier.outcomes.lock().unwrap().clone();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].job_id, job.id);
    assert_eq!(outcomes[0].owner_ref, OWNER);
    assert_eq!(outcomes[0].status, JobStatus::Completed);
    assert_eq!(outcomes[0].outputs, vec!["a.xml", "b.json"]);
}

#[tokio::test]
async fn test_notification_failure_does_not_change_job() {
    let h = harness_with(
        sh_converter(TWO_OUTPUTS.script),
        HarnessOptions {
            failing_notifier: true,
            ..HarnessOptions::default()
        },
    )
    .await;
    let job = h.run("book.pdf", b"pdf").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.notifier.outcomes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_submission_creates_nothing() {
    let h = harness(TWO_OUTPUTS.script).await;
    let request = SubmitRequest {
        original_name: "notes.docx".to_string(),
        owner_ref: OWNER.to_string(),
    };
    let mut content: &[u8] = b"docx";

    let result = h.orchestrator.submit(request, &mut content).await;
    assert!(matches!(result, Err(OrchestratorError::Invalid(_))));
    assert_eq!(h.object_count(), 0);
    assert!(h.jobs.list_by_status(JobStatus::Uploaded).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_job_releases_every_blob() {
    let h = harness(TWO_OUTPUTS.script).await;
    let job = h.run("book.pdf", b"pdf").await;
    assert_eq!(h.object_count(), 3);

    let releases = h.orchestrator.delete_job(job.id).await.unwrap();
    assert_eq!(releases.len(), 3);
    assert!(releases.iter().all(|r| r.released && r.error.is_none()));
    assert_eq!(releases[0].blob, job.input.blob);

    assert_eq!(h.object_count(), 0);
    assert!(matches!(
        h.orchestrator.delete_job(job.id).await,
        Err(OrchestratorError::State(StateError::NotFound(_)))
    ));
}

#[tokio::test]
async fn test_open_output() {
    let h = harness(TWO_OUTPUTS.script).await;
    let job = h.run("book.pdf", b"pdf").await;

    let (artifact, mut reader) = h.orchestrator.open_output(job.id, "b.json").await.unwrap();
    let mut content = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut content).await.unwrap();
    assert_eq!(artifact.size, 7);
    assert_eq!(content, r#"{"k":1}"#);

    assert!(matches!(
        h.orchestrator.open_output(job.id, "missing.xml").await,
        Err(OrchestratorError::OutputNotFound { .. })
    ));
}

#[tokio::test]
async fn test_missing_input_blob_is_storage_failure() {
    let h = harness(TWO_OUTPUTS.script).await;
    let job = h.submit("book.pdf", b"pdf").await;
    h.orchestrator.drain().await;
    let completed = h.jobs.get(job.id).await.unwrap();
    assert_eq!(completed.status, JobStatus::Completed);

    // A job whose input vanished before conversion started.
    let orphan = h.jobs.create(OWNER, completed.input.clone()).await.unwrap();
    h.blobs.delete(&completed.input.blob).await.unwrap();
    assert!(matches!(
        h.blobs.get(&completed.input.blob).await,
        Err(StorageError::NotFound(_))
    ));

    let report = h.orchestrator.recover().await.unwrap();
    assert_eq!(report.redispatched, 1);
    h.orchestrator.drain().await;

    let orphan = h.jobs.get(orphan.id).await.unwrap();
    assert_eq!(orphan.status, JobStatus::Failed);
    assert_eq!(orphan.error.unwrap().kind, ErrorKind::StorageFailure);
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_recover_after_restart() {
    let h = harness(TWO_OUTPUTS.script).await;

    // State left behind by a process that died mid-conversion.
    let mut content: &[u8] = b"pdf";
    let stored = h.blobs.put("waiting.pdf", &mut content).await.unwrap();
    let input = manuscript_convert::models::job::Artifact {
        name: "waiting.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        size: stored.size,
        blob: stored.blob,
    };
    let interrupted = h.jobs.create(OWNER, input.clone()).await.unwrap();
    h.jobs.mark_processing(interrupted.id).await.unwrap();
    let waiting = h.jobs.create(OWNER, input).await.unwrap();
    std::fs::create_dir_all(h.workspace_root.path().join(interrupted.id.to_string()).join("output")).unwrap();

    let report = h.orchestrator.recover().await.unwrap();
    assert_eq!(report.stale_workspaces, 1);
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.redispatched, 1);
    h.orchestrator.drain().await;

    let interrupted = h.jobs.get(interrupted.id).await.unwrap();
    assert_eq!(interrupted.status, JobStatus::Failed);
    assert_eq!(interrupted.error.unwrap().kind, ErrorKind::Interrupted);

    let waiting = h.jobs.get(waiting.id).await.unwrap();
    assert_eq!(waiting.status, JobStatus::Completed);
    assert_eq!(waiting.outputs.len(), 2);
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_output_upload_failure_rolls_back() {
    let h = harness_with(
        sh_converter(TWO_OUTPUTS.script),
        HarnessOptions {
            wrap_blobs: Some(fail_third_put),
            ..HarnessOptions::default()
        },
    )
    .await;
    let job = h.run("book.pdf", b"pdf").await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::StorageFailure);
    assert!(error.message.contains("b.json"), "message: {}", error.message);
    assert!(job.outputs.is_empty());

    // Only the input is left; the uploaded a.xml was released.
    assert_eq!(h.object_count(), 1);
    assert_eq!(h.read_blob(&job.input.blob).await, b"pdf");
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_delete_releases_outputs_of_a_finishing_job() {
    let h = harness_with(
        sh_converter(TWO_OUTPUTS.script),
        HarnessOptions {
            wrap_repository: Some(delete_after_finish),
            ..HarnessOptions::default()
        },
    )
    .await;
    let job = h.submit("book.pdf", b"pdf").await;

    // The record is removed only once the conversion has completed.
    let releases = h.orchestrator.delete_job(job.id).await.unwrap();
    h.orchestrator.drain().await;

    assert_eq!(releases.len(), 3);
    assert!(releases.iter().all(|r| r.released));
    assert_eq!(h.object_count(), 0);
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_deleting_running_job_ends_its_event_stream() {
    let h = harness(SLOW).await;
    let job = h.submit("book.pdf", b"pdf").await;
    let (_subscription, mut rx) = h.orchestrator.relay().subscribe_channel(job.id, 32);
    h.wait_for_status(job.id, JobStatus::Processing).await;

    let releases = h.orchestrator.delete_job(job.id).await.unwrap();
    assert_eq!(releases.len(), 1);
    h.orchestrator.drain().await;

    let mut kinds = Vec::new();
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
        last = Some(event);
    }
    assert_eq!(kinds.iter().filter(|k| k.is_terminal()).count(), 1);
    assert!(matches!(
        last.unwrap().payload,
        ProgressPayload::Failed { error_kind: ErrorKind::Cancelled, .. }
    ));
    assert_eq!(h.object_count(), 0);
    assert_eq!(h.workspace_entries(), 0);
}

#[tokio::test]
async fn test_lagging_subscriber_is_closed_not_starved() {
    let h = harness(CHATTY).await;
    let job = h.submit("book.pdf", b"pdf").await;
    let (_subscription, mut rx) = h.orchestrator.relay().subscribe_channel(job.id, 16);
    h.orchestrator.drain().await;

    let mut received = Vec::new();
    while let Some(event) = rx.recv().await {
        received.push(event);
    }
    assert_eq!(received.len(), 16);
    assert!(received.iter().all(|e| !e.kind().is_terminal()));

    // The closed channel tells the reader to fall back to the stored state.
    assert_eq!(h.jobs.get(job.id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_start_is_retried_when_job_store_errors() {
    let h = harness_with(
        sh_converter(TWO_OUTPUTS.script),
        HarnessOptions {
            wrap_repository: Some(flaky_start),
            ..HarnessOptions::default()
        },
    )
    .await;

    let started = std::time::Instant::now();
    let job = h.run("book.pdf", b"pdf").await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outputs.len(), 2);
    assert!(started.elapsed() >= Duration::from_millis(600));
}

#[tokio::test]
async fn test_jobs_listed_per_owner() {
    let h = harness(TWO_OUTPUTS.script).await;
    let first = h.submit("one.pdf", b"1").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.submit("two.epub", b"2").await;
    h.orchestrator.drain().await;

    let ids: Vec<_> = h.jobs.list_by_owner(OWNER).await.unwrap().iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert!(h.jobs.list_by_owner("someone-else").await.unwrap().is_empty());
}
