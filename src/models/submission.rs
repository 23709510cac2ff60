use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::job::{BlobRef, JobStatus, JobView};

/// Manuscript formats the converter accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ManuscriptFormat {
    Pdf,
    Epub,
}

impl ManuscriptFormat {
    /// Detect the format from the uploaded file name's extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        ext.parse().ok()
    }
}

/// Metadata accompanying an upload.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitRequest {
    #[garde(length(min = 1, max = 255), custom(supported_manuscript))]
    pub original_name: String,

    /// Opaque identity supplied by the auth layer.
    #[garde(length(min = 1, max = 128))]
    pub owner_ref: String,
}

fn supported_manuscript(value: &str, _ctx: &()) -> garde::Result {
    match ManuscriptFormat::from_file_name(value) {
        Some(_) => Ok(()),
        None => Err(garde::Error::new("only .pdf and .epub manuscripts are accepted")),
    }
}

/// Response after submitting a manuscript.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// One owner's jobs, newest first.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub total: usize,
}

/// Outcome of releasing one blob while deleting a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRelease {
    pub blob: BlobRef,
    pub released: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response after deleting a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub job_id: Uuid,
    pub releases: Vec<BlobRelease>,
}

/// Response after requesting cancellation.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    /// `false` when no conversion was queued or running for the job.
    pub cancellation_requested: bool,
}
