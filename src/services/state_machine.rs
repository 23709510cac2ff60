use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::job::{
    Artifact, ConversionJob, ErrorKind, JobError, JobStatus, Transition, TransitionOutcome,
};

/// Storage for job records.
///
/// `transition` must be atomic per job: load, [`ConversionJob::apply`] and
/// persist happen with no other writer in between, so readers never see a
/// half-applied change.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &ConversionJob) -> Result<(), RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<ConversionJob>, RepositoryError>;

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RepositoryError>;

    /// Remove a record and return it as it was at the moment of removal.
    async fn delete(&self, id: Uuid) -> Result<Option<ConversionJob>, RepositoryError>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ConversionJob>, RepositoryError>;

    /// Jobs of one owner, newest first.
    async fn list_by_owner(&self, owner_ref: &str) -> Result<Vec<ConversionJob>, RepositoryError>;

    async fn health_check(&self) -> Result<(), RepositoryError>;
}

/// Process-local repository, used by tests and tooling.
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<Uuid, ConversionJob>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: &ConversionJob) -> Result<(), RepositoryError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConversionJob>, RepositoryError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(TransitionOutcome::NotFound);
        };

        // Apply to a copy so a rejected transition leaves the record untouched.
        let mut updated = job.clone();
        match updated.apply(transition, now) {
            Ok(()) => {
                *job = updated.clone();
                Ok(TransitionOutcome::Applied(updated))
            }
            Err(reason) => Ok(TransitionOutcome::Rejected(reason)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<Option<ConversionJob>, RepositoryError> {
        Ok(self.jobs.write().await.remove(&id))
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ConversionJob>, RepositoryError> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn list_by_owner(&self, owner_ref: &str) -> Result<Vec<ConversionJob>, RepositoryError> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.owner_ref == owner_ref)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// The only component that changes job status.
///
/// Transition calls that do not fit the current status (duplicate completion
/// signals, a retry racing a cancel) are no-ops that return `Ok(None)`.
#[derive(Clone)]
pub struct JobStateMachine {
    repo: Arc<dyn JobRepository>,
}

impl JobStateMachine {
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self { repo }
    }

    /// Record a new job in `Uploaded` status.
    pub async fn create(&self, owner_ref: &str, input: Artifact) -> Result<ConversionJob, StateError> {
        let job = ConversionJob::new(owner_ref, input, Utc::now());
        self.repo.insert(&job).await?;
        tracing::info!(job_id = %job.id, input = %job.input.name, "Job created");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<ConversionJob, StateError> {
        self.repo.get(id).await?.ok_or(StateError::NotFound(id))
    }

    /// `Uploaded -> Processing`.
    pub async fn mark_processing(&self, id: Uuid) -> Result<Option<ConversionJob>, StateError> {
        self.apply(id, Transition::Start).await
    }

    /// `Processing -> Completed`, setting the output list once.
    pub async fn mark_completed(
        &self,
        id: Uuid,
        outputs: Vec<Artifact>,
    ) -> Result<Option<ConversionJob>, StateError> {
        self.apply(id, Transition::Complete(outputs)).await
    }

    /// `Uploaded | Processing -> Failed`.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<Option<ConversionJob>, StateError> {
        self.apply(id, Transition::Fail(JobError::new(kind, message))).await
    }

    /// Remove the record, returning its final state.
    pub async fn delete(&self, id: Uuid) -> Result<ConversionJob, StateError> {
        let job = self.repo.delete(id).await?.ok_or(StateError::NotFound(id))?;
        tracing::info!(job_id = %id, status = %job.status, "Job record deleted");
        Ok(job)
    }

    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ConversionJob>, StateError> {
        Ok(self.repo.list_by_status(status).await?)
    }

    pub async fn list_by_owner(&self, owner_ref: &str) -> Result<Vec<ConversionJob>, StateError> {
        Ok(self.repo.list_by_owner(owner_ref).await?)
    }

    pub async fn health_check(&self) -> Result<(), StateError> {
        Ok(self.repo.health_check().await?)
    }

    async fn apply(&self, id: Uuid, transition: Transition) -> Result<Option<ConversionJob>, StateError> {
        let target = transition.target();
        match self.repo.transition(id, transition, Utc::now()).await? {
            TransitionOutcome::Applied(job) => {
                tracing::info!(job_id = %id, status = %job.status, "Job status changed");
                Ok(Some(job))
            }
            TransitionOutcome::Rejected(reason) => {
                tracing::debug!(job_id = %id, to = %target, %reason, "Ignoring status change");
                Ok(None)
            }
            TransitionOutcome::NotFound => Err(StateError::NotFound(id)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
