use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::job::{
    Artifact, BlobRef, ConversionJob, ErrorKind, JobError, JobStatus, Transition, TransitionOutcome,
};
use crate::services::state_machine::RepositoryError;

const JOB_COLUMNS: &str = r#"
    id, owner_ref, input_name, input_content_type, input_size, input_blob_key, status,
    created_at, processing_started_at, processing_ended_at, processing_seconds,
    output_artifacts, error_kind, error_message
"#;

/// Insert a new conversion job
pub async fn insert_job(pool: &PgPool, job: &ConversionJob) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        INSERT INTO conversion_jobs (
            id, owner_ref, input_name, input_content_type, input_size, input_blob_key,
            status, created_at, output_artifacts
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(job.id)
    .bind(&job.owner_ref)
    .bind(&job.input.name)
    .bind(&job.input.content_type)
    .bind(size_to_db(job.id, job.input.size)?)
    .bind(job.input.blob.as_str())
    .bind(job.status.to_string())
    .bind(job.created_at)
    .bind(Json(&job.outputs))
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ConversionJob>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM conversion_jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| job_from_row(&r)).transpose()
}

/// Apply a status transition under a row lock.
///
/// The row is read `FOR UPDATE`, the transition is checked against the stored
/// status, and the new state is written in the same transaction. Rejected
/// transitions roll back without writing.
pub async fn apply_transition(
    pool: &PgPool,
    job_id: Uuid,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, RepositoryError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM conversion_jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(TransitionOutcome::NotFound);
    };

    let mut job = job_from_row(&row)?;
    if let Err(reason) = job.apply(transition, now) {
        tx.rollback().await?;
        return Ok(TransitionOutcome::Rejected(reason));
    }

    write_state(&mut tx, &job).await?;
    tx.commit().await?;

    Ok(TransitionOutcome::Applied(job))
}

async fn write_state(tx: &mut Transaction<'_, Postgres>, job: &ConversionJob) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        UPDATE conversion_jobs
        SET status = $2,
            processing_started_at = $3,
            processing_ended_at = $4,
            processing_seconds = $5,
            output_artifacts = $6,
            error_kind = $7,
            error_message = $8
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(job.status.to_string())
    .bind(job.processing_started_at)
    .bind(job.processing_ended_at)
    .bind(job.processing_seconds)
    .bind(Json(&job.outputs))
    .bind(job.error.as_ref().map(|e| e.kind.to_string()))
    .bind(job.error.as_ref().map(|e| e.message.clone()))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Delete a job record, returning the row as it was deleted
pub async fn delete_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ConversionJob>, RepositoryError> {
    let row = sqlx::query(&format!(
        "DELETE FROM conversion_jobs WHERE id = $1 RETURNING {JOB_COLUMNS}"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| job_from_row(&r)).transpose()
}

/// List jobs in a given status, oldest first
pub async fn list_jobs_by_status(
    pool: &PgPool,
    status: JobStatus,
) -> Result<Vec<ConversionJob>, RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM conversion_jobs WHERE status = $1 ORDER BY created_at ASC"
    ))
    .bind(status.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// List one owner's jobs, newest first
pub async fn list_jobs_by_owner(pool: &PgPool, owner_ref: &str) -> Result<Vec<ConversionJob>, RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM conversion_jobs WHERE owner_ref = $1 ORDER BY created_at DESC"
    ))
    .bind(owner_ref)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

fn job_from_row(r: &PgRow) -> Result<ConversionJob, RepositoryError> {
    let id: Uuid = r.try_get("id")?;
    let corrupt = |reason: String| RepositoryError::Corrupt { id, reason };

    let status_str: String = r.try_get("status")?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|_| corrupt(format!("unknown status '{status_str}'")))?;

    let error_kind: Option<String> = r.try_get("error_kind")?;
    let error_message: Option<String> = r.try_get("error_message")?;
    let error = match error_kind {
        Some(kind) => {
            let kind: ErrorKind = kind
                .parse()
                .map_err(|_| corrupt(format!("unknown error kind '{kind}'")))?;
            Some(JobError::new(kind, error_message.unwrap_or_default()))
        }
        None => None,
    };

    let input_size: i64 = r.try_get("input_size")?;
    let Json(outputs): Json<Vec<Artifact>> = r.try_get("output_artifacts")?;

    Ok(ConversionJob {
        id,
        owner_ref: r.try_get("owner_ref")?,
        input: Artifact {
            name: r.try_get("input_name")?,
            content_type: r.try_get("input_content_type")?,
            size: u64::try_from(input_size).map_err(|_| corrupt(format!("negative input size {input_size}")))?,
            blob: BlobRef::new(r.try_get::<String, _>("input_blob_key")?),
        },
        status,
        created_at: r.try_get("created_at")?,
        processing_started_at: r.try_get("processing_started_at")?,
        processing_ended_at: r.try_get("processing_ended_at")?,
        processing_seconds: r.try_get("processing_seconds")?,
        outputs,
        error,
    })
}

fn size_to_db(id: Uuid, size: u64) -> Result<i64, RepositoryError> {
    i64::try_from(size).map_err(|_| RepositoryError::Corrupt {
        id,
        reason: format!("input size {size} exceeds BIGINT"),
    })
}
