use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::models::job::{ConversionJob, JobError, JobStatus};

/// Summary of a job that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub owner_ref: String,
    pub input_name: String,
    pub status: JobStatus,
    pub outputs: Vec<String>,
    pub error: Option<JobError>,
}

impl From<&ConversionJob> for JobOutcome {
    fn from(job: &ConversionJob) -> Self {
        Self {
            job_id: job.id,
            owner_ref: job.owner_ref.clone(),
            input_name: job.input.name.clone(),
            status: job.status,
            outputs: job.outputs.iter().map(|o| o.name.clone()).collect(),
            error: job.error.clone(),
        }
    }
}

/// Tells the job's owner that it finished.
///
/// Delivery is fire-and-forget: a failed notification is logged and never
/// changes the job.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn notify(&self, outcome: &JobOutcome) -> Result<(), NotifyError>;
}

/// Writes outcomes to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl JobNotifier for TracingNotifier {
    async fn notify(&self, outcome: &JobOutcome) -> Result<(), NotifyError> {
        match &outcome.error {
            None => tracing::info!(
                job_id = %outcome.job_id,
                owner = %outcome.owner_ref,
                input = %outcome.input_name,
                outputs = outcome.outputs.len(),
                "Conversion completed"
            ),
            Some(error) => tracing::info!(
                job_id = %outcome.job_id,
                owner = %outcome.owner_ref,
                input = %outcome.input_name,
                error_kind = %error.kind,
                error = %error.message,
                "Conversion failed"
            ),
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}
