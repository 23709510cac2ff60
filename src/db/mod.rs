use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{ConversionJob, JobStatus, Transition, TransitionOutcome};
use crate::services::state_machine::{JobRepository, RepositoryError};

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

pub mod queries;

/// [`JobRepository`] backed by the `conversion_jobs` table.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, job: &ConversionJob) -> Result<(), RepositoryError> {
        queries::insert_job(&self.pool, job).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConversionJob>, RepositoryError> {
        queries::get_job(&self.pool, id).await
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RepositoryError> {
        queries::apply_transition(&self.pool, id, transition, now).await
    }

    async fn delete(&self, id: Uuid) -> Result<Option<ConversionJob>, RepositoryError> {
        queries::delete_job(&self.pool, id).await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ConversionJob>, RepositoryError> {
        queries::list_jobs_by_status(&self.pool, status).await
    }

    async fn list_by_owner(&self, owner_ref: &str) -> Result<Vec<ConversionJob>, RepositoryError> {
        queries::list_jobs_by_owner(&self.pool, owner_ref).await
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
