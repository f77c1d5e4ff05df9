use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::grading::{GradingResult, NewGradingResult};
use crate::models::job::{GradingJob, JobStage, JobStatus};
use crate::models::snapshot::AssignmentSnapshot;
use crate::models::submission::{AiStatus, SubmissionVersion};
use crate::store::{GradingStore, JobStore, SnapshotStore, SubmissionStore};

pub mod queries;
pub mod submission_queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
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

/// PostgreSQL implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(
        &self,
        submission_version_id: Uuid,
        assignment_snapshot_id: Option<Uuid>,
    ) -> Result<GradingJob, StoreError> {
        queries::create_job(&self.pool, submission_version_id, assignment_snapshot_id).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GradingJob>, StoreError> {
        queries::get_job(&self.pool, job_id).await
    }

    async fn latest_job_for_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<GradingJob>, StoreError> {
        queries::latest_job_for_submission(&self.pool, submission_version_id).await
    }

    async fn begin_attempt(
        &self,
        job_id: Uuid,
        observed_attempts: i32,
    ) -> Result<Option<GradingJob>, StoreError> {
        queries::begin_attempt(&self.pool, job_id, observed_attempts).await
    }

    async fn set_stage(
        &self,
        job_id: Uuid,
        attempt: i32,
        stage: JobStage,
    ) -> Result<bool, StoreError> {
        queries::set_stage(&self.pool, job_id, attempt, stage).await
    }

    async fn mark_succeeded(&self, job_id: Uuid, attempt: i32) -> Result<bool, StoreError> {
        queries::mark_succeeded(&self.pool, job_id, attempt).await
    }

    async fn return_to_queue(
        &self,
        job_id: Uuid,
        attempt: i32,
        error: &str,
    ) -> Result<bool, StoreError> {
        queries::return_to_queue(&self.pool, job_id, attempt, error).await
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        attempt: i32,
        error: &str,
    ) -> Result<bool, StoreError> {
        queries::mark_failed(&self.pool, job_id, attempt, error).await
    }

    async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<GradingJob>, StoreError> {
        queries::find_stale_running(&self.pool, cutoff, limit).await
    }

    async fn recover_stale(
        &self,
        job_id: Uuid,
        cutoff: DateTime<Utc>,
        note: &str,
    ) -> Result<bool, StoreError> {
        queries::recover_stale(&self.pool, job_id, cutoff, note).await
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        queries::count_by_status(&self.pool).await
    }
}

#[async_trait]
impl GradingStore for PgStore {
    async fn insert_result(&self, result: &NewGradingResult) -> Result<bool, StoreError> {
        queries::insert_result(&self.pool, result).await
    }

    async fn latest_result_for_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<GradingResult>, StoreError> {
        queries::latest_result_for_submission(&self.pool, submission_version_id).await
    }
}

#[async_trait]
impl SubmissionStore for PgStore {
    async fn get_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<SubmissionVersion>, StoreError> {
        submission_queries::get_submission(&self.pool, submission_version_id).await
    }

    async fn set_ai_status(
        &self,
        submission_version_id: Uuid,
        status: AiStatus,
    ) -> Result<(), StoreError> {
        submission_queries::set_ai_status(&self.pool, submission_version_id, status).await
    }

    async fn current_snapshot_id(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        submission_queries::current_snapshot_id(&self.pool, submission_version_id).await
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<AssignmentSnapshot>, StoreError> {
        submission_queries::get_snapshot(&self.pool, snapshot_id).await
    }
}
