use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Status of a grading job. `Succeeded` and `Failed` are sinks.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Where a running job currently is. Telemetry only: every attempt restarts
/// at `PrepareInput`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "snake_case")]
pub enum JobStage {
    PrepareInput,
    CallModel,
    ParseOutput,
    SaveResult,
}

/// One tracked attempt-lifecycle of grading a submission version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingJob {
    pub id: Uuid,
    pub submission_version_id: Uuid,
    pub assignment_snapshot_id: Option<Uuid>,
    pub status: JobStatus,
    pub stage: JobStage,
    pub attempts: i32,
    pub last_started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Externally visible view of a job, returned by status polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub submission_version_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<JobStage>,
    pub attempts: i32,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&GradingJob> for JobStatusView {
    fn from(job: &GradingJob) -> Self {
        Self {
            job_id: job.id,
            submission_version_id: job.submission_version_id,
            status: job.status,
            stage: (job.status == JobStatus::Running).then_some(job.stage),
            attempts: job.attempts,
            error: job.error.clone(),
            updated_at: job.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trips_through_column_text() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_ref()).unwrap(), status);
        }
        assert_eq!(JobStage::CallModel.as_ref(), "call_model");
    }

    #[test]
    fn test_stage_hidden_unless_running() {
        let now = Utc::now();
        let mut job = GradingJob {
            id: Uuid::new_v4(),
            submission_version_id: Uuid::new_v4(),
            assignment_snapshot_id: None,
            status: JobStatus::Queued,
            stage: JobStage::PrepareInput,
            attempts: 0,
            last_started_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        assert!(JobStatusView::from(&job).stage.is_none());

        job.status = JobStatus::Running;
        job.stage = JobStage::ParseOutput;
        assert_eq!(JobStatusView::from(&job).stage, Some(JobStage::ParseOutput));
    }
}
