use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{GradingStore, JobStore, SnapshotStore, SubmissionStore};
use crate::error::StoreError;
use crate::models::grading::{GradingResult, ModelIdentity, NewGradingResult};
use crate::models::job::{GradingJob, JobStage, JobStatus};
use crate::models::snapshot::AssignmentSnapshot;
use crate::models::submission::{AiStatus, SubmissionVersion};
use serde_json::Value;

/// In-process implementation of every store trait.
///
/// Each method runs under one lock, so conditional transitions are atomic in
/// the same way the PostgreSQL `UPDATE ... WHERE status = ...` statements are.
/// Status changes are recorded per job for inspection.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, GradingJob>,
    history: HashMap<Uuid, Vec<JobStatus>>,
    results: Vec<GradingResult>,
    submissions: HashMap<Uuid, SubmissionVersion>,
    current_snapshots: HashMap<Uuid, Uuid>,
    snapshots: HashMap<Uuid, AssignmentSnapshot>,
}

impl MemoryState {
    fn transition(
        &mut self,
        job_id: Uuid,
        allowed: &[JobStatus],
        apply: impl FnOnce(&mut GradingJob),
    ) -> Option<GradingJob> {
        let job = self.jobs.get_mut(&job_id)?;
        if !allowed.contains(&job.status) {
            return None;
        }
        let before = job.status;
        apply(job);
        job.updated_at = Utc::now();
        let after = job.clone();
        if after.status != before {
            self.history.entry(job_id).or_default().push(after.status);
        }
        Some(after)
    }

    /// Like [`MemoryState::transition`], but only while the job still
    /// carries `attempt` attempts.
    fn transition_owned(
        &mut self,
        job_id: Uuid,
        attempt: i32,
        allowed: &[JobStatus],
        apply: impl FnOnce(&mut GradingJob),
    ) -> Option<GradingJob> {
        if self.jobs.get(&job_id)?.attempts != attempt {
            return None;
        }
        self.transition(job_id, allowed, apply)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_submission(&self, submission: SubmissionVersion) {
        self.lock().submissions.insert(submission.id, submission);
    }

    pub fn add_snapshot(&self, snapshot: AssignmentSnapshot) {
        self.lock().snapshots.insert(snapshot.id, snapshot);
    }

    /// Mark `snapshot_id` as the published snapshot of `assignment_id`.
    pub fn publish_snapshot(&self, assignment_id: Uuid, snapshot_id: Uuid) {
        self.lock().current_snapshots.insert(assignment_id, snapshot_id);
    }

    pub fn ai_status(&self, submission_version_id: Uuid) -> Option<AiStatus> {
        self.lock()
            .submissions
            .get(&submission_version_id)
            .map(|s| s.ai_status)
    }

    /// Every status the job has held, starting with QUEUED.
    pub fn status_history(&self, job_id: Uuid) -> Vec<JobStatus> {
        self.lock().history.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn result_count(&self, job_id: Uuid) -> usize {
        self.lock().results.iter().filter(|r| r.job_id == job_id).count()
    }

    /// Mutate a stored job directly, bypassing transition rules.
    pub fn tamper_job(&self, job_id: Uuid, apply: impl FnOnce(&mut GradingJob)) {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            apply(job);
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(
        &self,
        submission_version_id: Uuid,
        assignment_snapshot_id: Option<Uuid>,
    ) -> Result<GradingJob, StoreError> {
        let now = Utc::now();
        let job = GradingJob {
            id: Uuid::new_v4(),
            submission_version_id,
            assignment_snapshot_id,
            status: JobStatus::Queued,
            stage: JobStage::PrepareInput,
            attempts: 0,
            last_started_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let mut state = self.lock();
        state.history.insert(job.id, vec![JobStatus::Queued]);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GradingJob>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn latest_job_for_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<GradingJob>, StoreError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.submission_version_id == submission_version_id)
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn begin_attempt(
        &self,
        job_id: Uuid,
        observed_attempts: i32,
    ) -> Result<Option<GradingJob>, StoreError> {
        let mut state = self.lock();
        if state.jobs.get(&job_id).map(|j| j.attempts) != Some(observed_attempts) {
            return Ok(None);
        }
        Ok(state.transition(job_id, &[JobStatus::Queued], |job| {
            job.status = JobStatus::Running;
            job.stage = JobStage::PrepareInput;
            job.attempts += 1;
            job.last_started_at = Some(Utc::now());
            job.error = None;
        }))
    }

    async fn set_stage(
        &self,
        job_id: Uuid,
        attempt: i32,
        stage: JobStage,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .transition_owned(job_id, attempt, &[JobStatus::Running], |job| job.stage = stage)
            .is_some())
    }

    async fn mark_succeeded(&self, job_id: Uuid, attempt: i32) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .transition_owned(job_id, attempt, &[JobStatus::Running], |job| {
                job.status = JobStatus::Succeeded;
                job.error = None;
            })
            .is_some())
    }

    async fn return_to_queue(
        &self,
        job_id: Uuid,
        attempt: i32,
        error: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .transition_owned(job_id, attempt, &[JobStatus::Running], |job| {
                job.status = JobStatus::Queued;
                job.stage = JobStage::PrepareInput;
                job.error = Some(error.to_string());
            })
            .is_some())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        attempt: i32,
        error: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .transition_owned(
                job_id,
                attempt,
                &[JobStatus::Queued, JobStatus::Running],
                |job| {
                    job.status = JobStatus::Failed;
                    job.error = Some(error.to_string());
                },
            )
            .is_some())
    }

    async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<GradingJob>, StoreError> {
        let mut stale: Vec<GradingJob> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| j.last_started_at.is_some_and(|t| t < cutoff))
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.last_started_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }

    async fn recover_stale(
        &self,
        job_id: Uuid,
        cutoff: DateTime<Utc>,
        note: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let still_stale = state
            .jobs
            .get(&job_id)
            .and_then(|j| j.last_started_at)
            .is_some_and(|t| t < cutoff);
        if !still_stale {
            return Ok(false);
        }
        Ok(state
            .transition(job_id, &[JobStatus::Running], |job| {
                job.status = JobStatus::Queued;
                job.stage = JobStage::PrepareInput;
                job.error = Some(note.to_string());
            })
            .is_some())
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let mut counts: HashMap<JobStatus, i64> = HashMap::new();
        for job in self.lock().jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

#[async_trait]
impl GradingStore for MemoryStore {
    async fn insert_result(&self, result: &NewGradingResult) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.results.iter().any(|r| r.job_id == result.job_id) {
            return Ok(false);
        }
        state.results.push(GradingResult {
            id: Uuid::new_v4(),
            job_id: result.job_id,
            submission_version_id: result.submission_version_id,
            assignment_snapshot_id: result.assignment_snapshot_id,
            model: ModelIdentity {
                name: result.model_name.clone(),
                version: result.model_version.clone(),
            },
            result: Value::Object(result.output.result.clone()),
            extracted: result.output.extracted.clone().map(Value::Object),
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn latest_result_for_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<GradingResult>, StoreError> {
        Ok(self
            .lock()
            .results
            .iter()
            .filter(|r| r.submission_version_id == submission_version_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn get_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<SubmissionVersion>, StoreError> {
        Ok(self.lock().submissions.get(&submission_version_id).cloned())
    }

    async fn set_ai_status(
        &self,
        submission_version_id: Uuid,
        status: AiStatus,
    ) -> Result<(), StoreError> {
        if let Some(submission) = self.lock().submissions.get_mut(&submission_version_id) {
            submission.ai_status = status;
        }
        Ok(())
    }

    async fn current_snapshot_id(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let state = self.lock();
        Ok(state
            .submissions
            .get(&submission_version_id)
            .and_then(|s| state.current_snapshots.get(&s.assignment_id))
            .copied())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Option<AssignmentSnapshot>, StoreError> {
        Ok(self.lock().snapshots.get(&snapshot_id).cloned())
    }
}
