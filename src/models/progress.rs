use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::models::job::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProgressKind {
    Started,
    ProgressText,
    Percentage,
    Validation,
    Error,
    Completed,
    Failed,
}

impl ProgressKind {
    /// `Completed` and `Failed` are the last event a job publishes.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressKind::Completed | ProgressKind::Failed)
    }
}

/// What happened. Converter output lines map onto the text, percentage,
/// validation and error variants; the orchestrator emits the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ProgressPayload {
    Started,
    ProgressText(String),
    Percentage(f64),
    Validation(String),
    Error(String),
    Completed { outputs: usize },
    Failed { error_kind: ErrorKind, message: String },
}

impl ProgressPayload {
    pub fn kind(&self) -> ProgressKind {
        match self {
            ProgressPayload::Started => ProgressKind::Started,
            ProgressPayload::ProgressText(_) => ProgressKind::ProgressText,
            ProgressPayload::Percentage(_) => ProgressKind::Percentage,
            ProgressPayload::Validation(_) => ProgressKind::Validation,
            ProgressPayload::Error(_) => ProgressKind::Error,
            ProgressPayload::Completed { .. } => ProgressKind::Completed,
            ProgressPayload::Failed { .. } => ProgressKind::Failed,
        }
    }
}

/// Ephemeral progress notification for one job. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub payload: ProgressPayload,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: Uuid, payload: ProgressPayload) -> Self {
        Self {
            job_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> ProgressKind {
        self.payload.kind()
    }
}
