use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::grading::GradingResult;
use crate::models::job::{GradingJob, JobStatus, JobStatusView};
use crate::models::payload::{DispatchPayload, SnapshotPolicy};
use crate::models::submission::AiStatus;
use crate::services::queue::{DispatchQueue, QueueDepth, QueueError};
use crate::services::recovery::{RecoveryReport, StaleJobRecovery};
use crate::store::StoreSet;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOverview {
    #[serde(flatten)]
    pub depth: QueueDepth,
    pub jobs: BTreeMap<String, i64>,
}

/// Producer side of the pipeline: job creation, status polling and the
/// operator actions exposed over HTTP.
#[derive(Clone)]
pub struct JobService {
    stores: StoreSet,
    queue: Arc<dyn DispatchQueue>,
    recovery: StaleJobRecovery,
}

impl JobService {
    pub fn new(stores: StoreSet, queue: Arc<dyn DispatchQueue>, stale_after: Duration) -> Self {
        Self {
            recovery: StaleJobRecovery::new(stores.clone(), queue.clone(), stale_after),
            stores,
            queue,
        }
    }

    /// Create a QUEUED job for a submission version and hand it to the queue.
    ///
    /// With the latest-published policy a missing snapshot is not an error
    /// here; the job is accepted and fails during execution.
    pub async fn create_job(
        &self,
        submission_version_id: Uuid,
        payload: DispatchPayload,
    ) -> Result<GradingJob, JobServiceError> {
        let submission = self
            .stores
            .submissions
            .get_submission(submission_version_id)
            .await?
            .ok_or(JobServiceError::SubmissionNotFound(submission_version_id))?;

        let snapshot_id = match payload.snapshot_policy {
            SnapshotPolicy::Specific => payload.assignment_snapshot_id,
            SnapshotPolicy::LatestPublished => {
                self.stores
                    .submissions
                    .current_snapshot_id(submission.id)
                    .await?
            }
        };
        if snapshot_id.is_none() {
            tracing::warn!(
                submission_version_id = %submission.id,
                policy = %payload.snapshot_policy,
                "No assignment snapshot resolved; job will fail when executed"
            );
        }

        let job = self.stores.jobs.insert_job(submission.id, snapshot_id).await?;
        self.stores
            .submissions
            .set_ai_status(submission.id, AiStatus::Pending)
            .await?;

        if let Err(e) = self.queue.enqueue(job.id, &payload).await {
            let message = format!("failed to enqueue job: {e}");
            self.stores
                .jobs
                .mark_failed(job.id, job.attempts, &message)
                .await?;
            self.stores
                .submissions
                .set_ai_status(submission.id, AiStatus::Failed)
                .await?;
            tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue grading job");
            return Err(JobServiceError::Enqueue(e));
        }

        metrics::counter!("grading_jobs_created_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            submission_version_id = %submission.id,
            assignment_snapshot_id = ?snapshot_id,
            "Grading job created"
        );
        Ok(job)
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<Option<JobStatusView>, JobServiceError> {
        let job = self.stores.jobs.get_job(job_id).await?;
        Ok(job.as_ref().map(JobStatusView::from))
    }

    pub async fn latest_job_status(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<JobStatusView>, JobServiceError> {
        let job = self
            .stores
            .jobs
            .latest_job_for_submission(submission_version_id)
            .await?;
        Ok(job.as_ref().map(JobStatusView::from))
    }

    pub async fn latest_result(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<GradingResult>, JobServiceError> {
        Ok(self
            .stores
            .results
            .latest_result_for_submission(submission_version_id)
            .await?)
    }

    /// Push a QUEUED job's id again, for deliveries lost before a consumer
    /// claimed them. Duplicate deliveries are ignored by the worker.
    pub async fn requeue(&self, job_id: Uuid) -> Result<JobStatusView, JobServiceError> {
        let job = self
            .stores
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(JobServiceError::JobNotFound(job_id))?;
        if job.status != JobStatus::Queued {
            return Err(JobServiceError::NotQueued(job.status));
        }

        self.queue.readmit(job_id).await?;
        tracing::info!(job_id = %job_id, attempts = job.attempts, "Job manually requeued");
        Ok(JobStatusView::from(&job))
    }

    /// Recover stale RUNNING jobs, optionally with a one-off threshold.
    pub async fn recover_stale(
        &self,
        stale_after: Option<Duration>,
    ) -> Result<RecoveryReport, JobServiceError> {
        let report = match stale_after {
            Some(threshold) => self.recovery.recover_older_than(threshold).await?,
            None => self.recovery.recover_once().await?,
        };
        Ok(report)
    }

    pub async fn queue_overview(&self) -> Result<QueueOverview, JobServiceError> {
        let depth = self.queue.depth().await?;
        metrics::gauge!("grading_queue_depth").set(depth.ready as f64);

        let mut jobs: BTreeMap<String, i64> =
            JobStatus::iter().map(|s| (s.to_string(), 0)).collect();
        for (status, count) in self.stores.jobs.count_by_status().await? {
            jobs.insert(status.to_string(), count);
        }
        Ok(QueueOverview { depth, jobs })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("submission version {0} not found")]
    SubmissionNotFound(Uuid),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("only queued jobs can be requeued; job is {0}")]
    NotQueued(JobStatus),

    #[error("failed to enqueue job: {0}")]
    Enqueue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::submission::SubmissionVersion;
    use crate::services::queue::MemoryDispatchQueue;
    use crate::store::MemoryStore;

    fn submission(assignment_id: Uuid) -> SubmissionVersion {
        SubmissionVersion {
            id: Uuid::new_v4(),
            assignment_id,
            question_id: Uuid::new_v4(),
            content_text: Some("42".into()),
            answer_payload: None,
            answer_format: None,
            file_url: String::new(),
            ai_status: AiStatus::Skipped,
        }
    }

    fn service() -> (JobService, Arc<MemoryStore>, Arc<MemoryDispatchQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryDispatchQueue::default());
        let service = JobService::new(
            StoreSet::shared(store.clone()),
            queue.clone(),
            Duration::from_secs(300),
        );
        (service, store, queue)
    }

    #[tokio::test]
    async fn test_create_job_uses_latest_published_snapshot() {
        let (service, store, queue) = service();
        let assignment_id = Uuid::new_v4();
        let snapshot_id = Uuid::new_v4();
        let sub = submission(assignment_id);
        store.add_submission(sub.clone());
        store.publish_snapshot(assignment_id, snapshot_id);

        let job = service.create_job(sub.id, DispatchPayload::default()).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.assignment_snapshot_id, Some(snapshot_id));
        assert_eq!(store.ai_status(sub.id), Some(AiStatus::Pending));

        assert_eq!(queue.dequeue(Duration::from_millis(10)).await.unwrap(), Some(job.id));
        assert!(queue.get_payload(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_job_accepts_missing_snapshot() {
        let (service, store, _queue) = service();
        let sub = submission(Uuid::new_v4());
        store.add_submission(sub.clone());

        let job = service.create_job(sub.id, DispatchPayload::default()).await.unwrap();
        assert_eq!(job.assignment_snapshot_id, None);
    }

    #[tokio::test]
    async fn test_create_job_unknown_submission() {
        let (service, _store, _queue) = service();
        let err = service
            .create_job(Uuid::new_v4(), DispatchPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobServiceError::SubmissionNotFound(_)));
    }

    #[tokio::test]
    async fn test_requeue_only_queued_jobs() {
        let (service, store, queue) = service();
        let sub = submission(Uuid::new_v4());
        store.add_submission(sub.clone());
        let job = service.create_job(sub.id, DispatchPayload::default()).await.unwrap();
        queue.dequeue(Duration::from_millis(10)).await.unwrap();

        service.requeue(job.id).await.unwrap();
        assert_eq!(queue.dequeue(Duration::from_millis(10)).await.unwrap(), Some(job.id));

        use crate::store::JobStore;
        store.begin_attempt(job.id, 0).await.unwrap();
        let err = service.requeue(job.id).await.unwrap_err();
        assert!(matches!(err, JobServiceError::NotQueued(JobStatus::Running)));
    }

    #[tokio::test]
    async fn test_queue_overview_counts_every_status() {
        let (service, store, _queue) = service();
        let sub = submission(Uuid::new_v4());
        store.add_submission(sub.clone());
        service.create_job(sub.id, DispatchPayload::default()).await.unwrap();

        let overview = service.queue_overview().await.unwrap();
        assert_eq!(overview.depth.ready, 1);
        assert_eq!(overview.jobs.get("queued"), Some(&1));
        assert_eq!(overview.jobs.get("failed"), Some(&0));
        assert_eq!(overview.jobs.len(), 4);
    }
}
