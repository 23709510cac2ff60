use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle status of a conversion job.
///
/// Jobs only ever move `Uploaded -> Processing -> {Completed | Failed}`, with
/// the single shortcut `Uploaded -> Failed` for jobs that fail before the
/// converter starts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Classified reason a job ended up `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    SpawnFailure,
    ConversionFailed,
    EmptyOutput,
    StorageFailure,
    Cancelled,
    TimedOut,
    /// The service stopped while the job was processing.
    Interrupted,
}

/// Opaque key of an object in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to binary content held by the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub blob: BlobRef,
}

/// Last error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A manuscript conversion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: Uuid,
    pub owner_ref: String,
    pub input: Artifact,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_ended_at: Option<DateTime<Utc>>,
    pub processing_seconds: Option<f64>,
    pub outputs: Vec<Artifact>,
    pub error: Option<JobError>,
}

/// A requested status change.
#[derive(Debug, Clone)]
pub enum Transition {
    Start,
    Complete(Vec<Artifact>),
    Fail(JobError),
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Start => JobStatus::Processing,
            Transition::Complete(_) => JobStatus::Completed,
            Transition::Fail(_) => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot move job from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Result of atomically applying a [`Transition`] to a stored job.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(ConversionJob),
    Rejected(TransitionError),
    NotFound,
}

impl ConversionJob {
    pub fn new(owner_ref: impl Into<String>, input: Artifact, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_ref: owner_ref.into(),
            input,
            status: JobStatus::Uploaded,
            created_at: now,
            processing_started_at: None,
            processing_ended_at: None,
            processing_seconds: None,
            outputs: Vec::new(),
            error: None,
        }
    }

    /// Apply a transition in place.
    ///
    /// Status and the fields that belong to it are updated together; on error
    /// the job is left untouched. Terminal jobs reject every transition.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let rejected = TransitionError {
            from: self.status,
            to: transition.target(),
        };

        match (self.status, transition) {
            (JobStatus::Uploaded, Transition::Start) => {
                self.status = JobStatus::Processing;
                self.processing_started_at = Some(now);
            }
            (JobStatus::Processing, Transition::Complete(outputs)) => {
                self.status = JobStatus::Completed;
                self.finish(now);
                self.outputs = outputs;
            }
            (JobStatus::Uploaded | JobStatus::Processing, Transition::Fail(error)) => {
                self.status = JobStatus::Failed;
                self.finish(now);
                self.error = Some(error);
            }
            _ => return Err(rejected),
        }

        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.processing_ended_at = Some(now);
        self.processing_seconds = self
            .processing_started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
    }

    /// Every blob this job references, input first.
    pub fn blobs(&self) -> Vec<BlobRef> {
        std::iter::once(self.input.blob.clone())
            .chain(self.outputs.iter().map(|a| a.blob.clone()))
            .collect()
    }
}

/// Public projection of a job, without blob-store keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub input_name: String,
    pub input_size: u64,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_ended_at: Option<DateTime<Utc>>,
    pub processing_seconds: Option<f64>,
    pub outputs: Vec<OutputView>,
    pub error: Option<JobError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputView {
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

impl From<&ConversionJob> for JobView {
    fn from(job: &ConversionJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            input_name: job.input.name.clone(),
            input_size: job.input.size,
            created_at: job.created_at,
            processing_started_at: job.processing_started_at,
            processing_ended_at: job.processing_ended_at,
            processing_seconds: job.processing_seconds,
            outputs: job
                .outputs
                .iter()
                .map(|a| OutputView {
                    name: a.name.clone(),
                    content_type: a.content_type.clone(),
                    size: a.size,
                })
                .collect(),
            error: job.error.clone(),
        }
    }
}
