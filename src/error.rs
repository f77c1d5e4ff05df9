//! Error types shared across the pipeline.
//!
//! Every failure inside a job's execution becomes a [`PipelineError`]. The
//! worker converts it into either a scheduled retry or a terminal failure;
//! its `Display` text is what job-status polling surfaces as `error`.

use std::time::Duration;
use uuid::Uuid;

use crate::services::invoker::InvokeError;
use crate::services::parser::ParseError;
use crate::services::queue::QueueError;

/// Failure of a job-record, grading-result or collaborator store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored value could not be decoded: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("dispatch payload missing for job")]
    MissingPayload,

    #[error("submission version {0} not found")]
    SubmissionNotFound(Uuid),

    #[error("job has no assignment snapshot assigned")]
    SnapshotUnassigned,

    #[error("assignment snapshot {0} not found")]
    SnapshotNotFound(Uuid),

    #[error("question {question_id} not found in snapshot {snapshot_id}")]
    QuestionNotFound { snapshot_id: Uuid, question_id: Uuid },

    #[error("snapshot {snapshot_id} is malformed: {reason}")]
    MalformedSnapshot { snapshot_id: Uuid, reason: String },

    #[error("grader invocation failed: {0}")]
    Invocation(#[from] InvokeError),

    #[error("grader output rejected: {0}")]
    Output(#[from] ParseError),

    #[error("job exceeded its deadline of {}s", .0.as_secs())]
    DeadlineExceeded(Duration),

    #[error("exceeded retry budget of {0} attempts")]
    RetryBudgetExceeded(u32),

    /// The job was recovered and claimed by a newer attempt.
    #[error("attempt {0} no longer owns the job")]
    Superseded(u32),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl PipelineError {
    /// Everything is retried until the attempt budget runs out, except budget
    /// exhaustion itself. A superseded attempt is neither retried nor failed;
    /// the attempt that replaced it owns the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::RetryBudgetExceeded(_) | PipelineError::Superseded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_budget_exhaustion_is_terminal() {
        assert!(PipelineError::MissingPayload.is_retryable());
        assert!(PipelineError::Output(ParseError::NotJson).is_retryable());
        assert!(PipelineError::Invocation(InvokeError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(!PipelineError::RetryBudgetExceeded(3).is_retryable());
        assert!(!PipelineError::Superseded(1).is_retryable());
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = PipelineError::RetryBudgetExceeded(3);
        assert_eq!(err.to_string(), "exceeded retry budget of 3 attempts");
        let err = PipelineError::DeadlineExceeded(Duration::from_secs(210));
        assert_eq!(err.to_string(), "job exceeded its deadline of 210s");
    }
}
