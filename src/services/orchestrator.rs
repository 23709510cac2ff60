//! Control loop that drives an uploaded manuscript through conversion.
//!
//! `submit` stores the input, records the job and returns. Everything after
//! that runs on a tracked background task: materialize the input into a
//! workspace, run the converter, upload the outputs, finalize the job and
//! remove the workspace. Every failure along the way ends as a `Failed` job
//! with a classified [`ErrorKind`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use garde::Validate;
use tokio::io::AsyncRead;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::models::job::{
    Artifact, BlobRef, ConversionJob, ErrorKind, JobError, JobStatus,
};
use crate::models::progress::{ProgressEvent, ProgressPayload};
use crate::models::submission::{BlobRelease, SubmitRequest};
use crate::services::converter::{ConverterError, ConverterRunner};
use crate::services::notify::{JobNotifier, JobOutcome};
use crate::services::relay::ProgressRelay;
use crate::services::state_machine::{JobStateMachine, StateError};
use crate::services::storage::{content_type_for, BlobReader, BlobStore, StorageError};
use crate::services::workspace::{self, Workspace};

/// Attempts at moving a job to `Processing` while the job store is failing.
const START_ATTEMPTS: u32 = 5;
const START_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workspace_root: PathBuf,
    /// Upper bound on converter processes running at once.
    pub max_concurrent_runs: usize,
    pub conversion_timeout: Duration,
}

/// What the start-up recovery sweep found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub stale_workspaces: usize,
    pub interrupted: usize,
    pub redispatched: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    blobs: Arc<dyn BlobStore>,
    jobs: JobStateMachine,
    runner: ConverterRunner,
    relay: Arc<ProgressRelay>,
    notifier: Arc<dyn JobNotifier>,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
    tasks: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        jobs: JobStateMachine,
        runner: ConverterRunner,
        relay: Arc<ProgressRelay>,
        notifier: Arc<dyn JobNotifier>,
        config: OrchestratorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            inner: Arc::new(Inner {
                blobs,
                jobs,
                runner,
                relay,
                notifier,
                config,
                permits,
                cancellations: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn jobs(&self) -> &JobStateMachine {
        &self.inner.jobs
    }

    pub fn relay(&self) -> &Arc<ProgressRelay> {
        &self.inner.relay
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.inner.blobs
    }

    /// Store the uploaded manuscript, record the job as `Uploaded` and
    /// schedule its conversion. Returns before conversion starts.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ConversionJob, OrchestratorError> {
        request.validate()?;

        let stored = self.inner.blobs.put(&request.original_name, content).await?;
        let input = Artifact {
            content_type: content_type_for(&request.original_name),
            name: request.original_name,
            size: stored.size,
            blob: stored.blob.clone(),
        };

        let job = match self.inner.jobs.create(&request.owner_ref, input).await {
            Ok(job) => job,
            Err(e) => {
                self.inner.blobs.release_all(&[stored.blob]).await;
                return Err(e.into());
            }
        };

        metrics::counter!("conversion_jobs_submitted").increment(1);
        self.dispatch(job.id);
        Ok(job)
    }

    /// Signal cancellation for a queued or running job. Returns `false` when
    /// no background work is registered for it.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let cancellations = self.inner.cancellations.lock().unwrap_or_else(PoisonError::into_inner);
        match cancellations.get(&job_id) {
            Some(token) => {
                tracing::info!(job_id = %job_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Delete a job and release every blob it references.
    ///
    /// The blobs released are those of the record as it was removed. Outputs
    /// uploaded by a conversion that finishes after the removal are released
    /// by that conversion. Unfinished work is cancelled and subscribers get a
    /// terminal event. Blob release failures are reported per blob and do not
    /// stop the others.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<Vec<BlobRelease>, OrchestratorError> {
        let job = self.inner.jobs.delete(job_id).await?;
        if !job.status.is_terminal() {
            self.cancel(job_id);
            self.publish(
                job_id,
                ProgressPayload::Failed {
                    error_kind: ErrorKind::Cancelled,
                    message: "job deleted".to_string(),
                },
            );
        }

        let releases = self.inner.blobs.release_all(&job.blobs()).await;
        let failed = releases.iter().filter(|r| !r.released).count();
        tracing::info!(job_id = %job_id, blobs = releases.len(), failed, "Job deleted");
        Ok(releases)
    }

    /// Open one output artifact of a job for streaming.
    pub async fn open_output(
        &self,
        job_id: Uuid,
        name: &str,
    ) -> Result<(Artifact, BlobReader), OrchestratorError> {
        let job = self.inner.jobs.get(job_id).await?;
        let artifact = job
            .outputs
            .into_iter()
            .find(|o| o.name == name)
            .ok_or_else(|| OrchestratorError::OutputNotFound {
                job_id,
                name: name.to_string(),
            })?;
        let reader = self.inner.blobs.get(&artifact.blob).await?;
        Ok((artifact, reader))
    }

    /// Bring persisted state in line with a freshly started process: remove
    /// leftover workspaces, fail jobs that were mid-conversion and re-queue
    /// jobs that never started.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport {
            stale_workspaces: workspace::sweep_stale(&self.inner.config.workspace_root)
                .await
                .map_err(OrchestratorError::Workspace)?,
            ..RecoveryReport::default()
        };

        for job in self.inner.jobs.list_by_status(JobStatus::Processing).await? {
            let error = JobError::new(
                ErrorKind::Interrupted,
                "service restarted while the conversion was running",
            );
            self.fail(job.id, Vec::new(), error).await;
            report.interrupted += 1;
        }

        for job in self.inner.jobs.list_by_status(JobStatus::Uploaded).await? {
            self.dispatch(job.id);
            report.redispatched += 1;
        }

        tracing::info!(
            stale_workspaces = report.stale_workspaces,
            interrupted = report.interrupted,
            redispatched = report.redispatched,
            "Recovery sweep finished"
        );
        Ok(report)
    }

    /// Wait until every background task spawned so far has finished.
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    fn dispatch(&self, job_id: Uuid) {
        let token = CancellationToken::new();
        self.inner
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, token.clone());

        let this = self.clone();
        self.inner.tasks.spawn(async move {
            this.process(job_id, token).await;
        });
    }

    async fn process(&self, job_id: Uuid, cancel: CancellationToken) {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let error = JobError::new(ErrorKind::Cancelled, "conversion cancelled before it started");
                self.fail(job_id, Vec::new(), error).await;
                self.forget(job_id);
                return;
            }
            permit = Arc::clone(&self.inner.permits).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            self.forget(job_id);
            return;
        };

        let Some(job) = self.start(job_id, &cancel).await else {
            self.forget(job_id);
            return;
        };

        let started = Instant::now();
        metrics::gauge!("conversion_active_runs").increment(1.0);
        self.publish(job_id, ProgressPayload::Started);

        let mut uploaded = Vec::new();
        match self.convert(&job, &cancel, &mut uploaded).await {
            Ok(outputs) => self.complete(job_id, outputs, uploaded).await,
            Err(error) => self.fail(job_id, uploaded, error).await,
        }

        metrics::histogram!("conversion_processing_seconds").record(started.elapsed().as_secs_f64());
        metrics::gauge!("conversion_active_runs").decrement(1.0);
        self.forget(job_id);
    }

    /// `Uploaded -> Processing`, retried with backoff while the job store
    /// errors. `None` means the job must not run.
    async fn start(&self, job_id: Uuid, cancel: &CancellationToken) -> Option<ConversionJob> {
        let mut delay = START_RETRY_DELAY;
        for attempt in 1..=START_ATTEMPTS {
            match self.inner.jobs.mark_processing(job_id).await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {
                    tracing::debug!(job_id = %job_id, "Job is no longer waiting, skipping");
                    return None;
                }
                Err(StateError::NotFound(_)) => {
                    tracing::debug!(job_id = %job_id, "Job deleted before it started");
                    return None;
                }
                Err(e) if attempt == START_ATTEMPTS => {
                    tracing::error!(
                        job_id = %job_id,
                        error = %e,
                        attempts = attempt,
                        "Failed to start job, leaving it for the next recovery sweep"
                    );
                    return None;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, attempt, "Failed to start job, retrying");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let error = JobError::new(ErrorKind::Cancelled, "conversion cancelled before it started");
                    self.fail(job_id, Vec::new(), error).await;
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay *= 2;
        }
        None
    }

    /// Run one conversion inside a fresh workspace, bounded by cancellation
    /// and the configured timeout. The workspace is removed on every path.
    async fn convert(
        &self,
        job: &ConversionJob,
        cancel: &CancellationToken,
        uploaded: &mut Vec<BlobRef>,
    ) -> Result<Vec<Artifact>, JobError> {
        let workspace = Workspace::create(&self.inner.config.workspace_root, job.id, &job.input.name)
            .await
            .map_err(|e| {
                JobError::new(ErrorKind::StorageFailure, format!("failed to prepare workspace: {}", e.kind()))
            })?;

        let timeout = self.inner.config.conversion_timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(JobError::new(ErrorKind::Cancelled, "conversion cancelled")),
            _ = tokio::time::sleep(timeout) => Err(JobError::new(
                ErrorKind::TimedOut,
                format!("conversion exceeded the {}s limit", timeout.as_secs_f64()),
            )),
            result = self.run_in_workspace(job, &workspace, uploaded) => result,
        };

        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.cleanup().await {
            tracing::warn!(job_id = %job.id, path = %path.display(), error = %e, "Failed to remove workspace");
        }

        result
    }

    async fn run_in_workspace(
        &self,
        job: &ConversionJob,
        workspace: &Workspace,
        uploaded: &mut Vec<BlobRef>,
    ) -> Result<Vec<Artifact>, JobError> {
        self.inner
            .blobs
            .materialize_to_local(&job.input.blob, workspace.input_path())
            .await
            .map_err(|e| JobError::new(ErrorKind::StorageFailure, format!("failed to fetch input: {e}")))?;

        let relay = Arc::clone(&self.inner.relay);
        let job_id = job.id;
        let on_event = move |payload: ProgressPayload| relay.publish(ProgressEvent::new(job_id, payload));

        let run = self
            .inner
            .runner
            .run(workspace.input_path(), workspace.output_dir(), &on_event)
            .await
            .map_err(|e| classify_converter_error(&e, workspace.path()))?;

        let mut artifacts = Vec::with_capacity(run.outputs.len());
        for output in run.outputs {
            let upload_failed = |e: &dyn std::fmt::Display| {
                JobError::new(ErrorKind::StorageFailure, format!("failed to upload '{}': {e}", output.name))
            };
            let mut file = tokio::fs::File::open(&output.path)
                .await
                .map_err(|e| upload_failed(&e))?;
            let stored = self
                .inner
                .blobs
                .put(&output.name, &mut file)
                .await
                .map_err(|e| upload_failed(&e))?;

            uploaded.push(stored.blob.clone());
            artifacts.push(Artifact {
                name: output.name,
                content_type: output.content_type,
                size: stored.size,
                blob: stored.blob,
            });
        }

        Ok(artifacts)
    }

    async fn complete(&self, job_id: Uuid, outputs: Vec<Artifact>, uploaded: Vec<BlobRef>) {
        let count = outputs.len();
        match self.inner.jobs.mark_completed(job_id, outputs).await {
            Ok(Some(job)) => {
                metrics::counter!("conversion_jobs_completed").increment(1);
                self.publish(job_id, ProgressPayload::Completed { outputs: count });
                self.notify(&job);
            }
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Completion ignored, releasing uploaded outputs");
                self.inner.blobs.release_all(&uploaded).await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to complete job, releasing uploaded outputs");
                self.inner.blobs.release_all(&uploaded).await;
            }
        }
    }

    async fn fail(&self, job_id: Uuid, uploaded: Vec<BlobRef>, error: JobError) {
        if !uploaded.is_empty() {
            tracing::debug!(job_id = %job_id, blobs = uploaded.len(), "Rolling back uploaded outputs");
            self.inner.blobs.release_all(&uploaded).await;
        }

        tracing::warn!(job_id = %job_id, error_kind = %error.kind, error = %error.message, "Conversion failed");
        match self.inner.jobs.mark_failed(job_id, error.kind, error.message.clone()).await {
            Ok(Some(job)) => {
                metrics::counter!("conversion_jobs_failed", "kind" => error.kind.to_string()).increment(1);
                self.publish(
                    job_id,
                    ProgressPayload::Failed {
                        error_kind: error.kind,
                        message: error.message,
                    },
                );
                self.notify(&job);
            }
            Ok(None) => tracing::debug!(job_id = %job_id, "Job already finished, failure not recorded"),
            Err(StateError::NotFound(_)) => tracing::debug!(job_id = %job_id, "Job deleted, failure not recorded"),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to record job failure"),
        }
    }

    fn publish(&self, job_id: Uuid, payload: ProgressPayload) {
        self.inner.relay.publish(ProgressEvent::new(job_id, payload));
    }

    fn notify(&self, job: &ConversionJob) {
        let outcome = JobOutcome::from(job);
        let notifier = Arc::clone(&self.inner.notifier);
        self.inner.tasks.spawn(async move {
            if let Err(e) = notifier.notify(&outcome).await {
                tracing::warn!(job_id = %outcome.job_id, error = %e, "Job notification failed");
            }
        });
    }

    fn forget(&self, job_id: Uuid) {
        self.inner
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
    }
}

fn classify_converter_error(error: &ConverterError, workspace: &Path) -> JobError {
    let redact = |message: String| message.replace(workspace.to_string_lossy().as_ref(), "<workspace>");
    match error {
        ConverterError::Spawn { source, .. } => JobError::new(
            ErrorKind::SpawnFailure,
            format!("converter could not be started ({})", source.kind()),
        ),
        ConverterError::EmptyOutput => JobError::new(ErrorKind::EmptyOutput, error.to_string()),
        _ => JobError::new(ErrorKind::ConversionFailed, redact(error.to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid submission: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Job {job_id} has no output named '{name}'")]
    OutputNotFound { job_id: Uuid, name: String },

    #[error("Workspace error: {0}")]
    Workspace(std::io::Error),
}
