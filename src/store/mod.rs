//! Storage seams of the pipeline.
//!
//! [`JobStore`] and [`GradingStore`] are owned by this subsystem; the
//! submission and snapshot stores are read/write views onto collaborator
//! tables. Every job status transition is a single conditional update: the
//! methods return `false` / `None` when the job was not in the expected state,
//! which is how concurrent consumers lose races without double-executing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::grading::{GradingResult, NewGradingResult};
use crate::models::job::{GradingJob, JobStage, JobStatus};
use crate::models::snapshot::AssignmentSnapshot;
use crate::models::submission::{AiStatus, SubmissionVersion};

pub mod memory;

pub use memory::MemoryStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job with status QUEUED and zero attempts.
    async fn insert_job(
        &self,
        submission_version_id: Uuid,
        assignment_snapshot_id: Option<Uuid>,
    ) -> Result<GradingJob, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GradingJob>, StoreError>;

    async fn latest_job_for_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<GradingJob>, StoreError>;

    /// QUEUED -> RUNNING at `PrepareInput`, only if the job is still QUEUED
    /// with `observed_attempts` attempts. Increments `attempts`, stamps
    /// `last_started_at` and clears `error`.
    async fn begin_attempt(
        &self,
        job_id: Uuid,
        observed_attempts: i32,
    ) -> Result<Option<GradingJob>, StoreError>;

    // The transitions below only match while the job still carries
    // `attempt` attempts, so a superseded attempt can never touch the row of
    // the attempt that replaced it.

    /// Record progress of a RUNNING job. Returns `false` when `attempt` no
    /// longer owns the job.
    async fn set_stage(
        &self,
        job_id: Uuid,
        attempt: i32,
        stage: JobStage,
    ) -> Result<bool, StoreError>;

    /// RUNNING -> SUCCEEDED.
    async fn mark_succeeded(&self, job_id: Uuid, attempt: i32) -> Result<bool, StoreError>;

    /// RUNNING -> QUEUED at `PrepareInput`, keeping `error` for diagnosis.
    async fn return_to_queue(
        &self,
        job_id: Uuid,
        attempt: i32,
        error: &str,
    ) -> Result<bool, StoreError>;

    /// QUEUED or RUNNING -> FAILED.
    async fn mark_failed(
        &self,
        job_id: Uuid,
        attempt: i32,
        error: &str,
    ) -> Result<bool, StoreError>;

    /// RUNNING jobs whose current attempt started before `cutoff`, oldest first.
    async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<GradingJob>, StoreError>;

    /// RUNNING -> QUEUED, only if the attempt still started before `cutoff`.
    async fn recover_stale(
        &self,
        job_id: Uuid,
        cutoff: DateTime<Utc>,
        note: &str,
    ) -> Result<bool, StoreError>;

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError>;
}

#[async_trait]
pub trait GradingStore: Send + Sync {
    /// Insert the result for a job. Returns `false` when the job already has
    /// one; the stored result is never replaced.
    async fn insert_result(&self, result: &NewGradingResult) -> Result<bool, StoreError>;

    async fn latest_result_for_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<GradingResult>, StoreError>;
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn get_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<SubmissionVersion>, StoreError>;

    async fn set_ai_status(
        &self,
        submission_version_id: Uuid,
        status: AiStatus,
    ) -> Result<(), StoreError>;

    /// Current published snapshot of the assignment the submission belongs to.
    async fn current_snapshot_id(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<AssignmentSnapshot>, StoreError>;
}

/// The four stores the pipeline talks to, usually backed by one value.
#[derive(Clone)]
pub struct StoreSet {
    pub jobs: Arc<dyn JobStore>,
    pub results: Arc<dyn GradingStore>,
    pub submissions: Arc<dyn SubmissionStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl StoreSet {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: JobStore + GradingStore + SubmissionStore + SnapshotStore + 'static,
    {
        Self {
            jobs: store.clone(),
            results: store.clone(),
            submissions: store.clone(),
            snapshots: store,
        }
    }
}
