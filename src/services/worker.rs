//! Consumer side of the pipeline.
//!
//! A worker takes job ids off the dispatch queue and drives each job through
//! `PREPARE_INPUT -> CALL_MODEL -> PARSE_OUTPUT -> SAVE_RESULT`. Redelivered
//! or duplicate ids are harmless: a job is only executed after winning the
//! conditional QUEUED -> RUNNING transition.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{PipelineError, StoreError};
use crate::models::grading::{NewGradingResult, ParsedOutput};
use crate::models::job::{GradingJob, JobStage, JobStatus};
use crate::models::submission::AiStatus;
use crate::services::auto_rule;
use crate::services::invoker::{GradingInvoker, GradingRequest};
use crate::services::parser::parse_model_output;
use crate::services::queue::DispatchQueue;
use crate::services::retry::RetryScheduler;
use crate::services::snapshot::SnapshotResolver;
use crate::store::StoreSet;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Wall-clock bound on one attempt, covering every stage.
    pub job_deadline: Duration,
    /// How long one dequeue call may block.
    pub poll_wait: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            job_deadline: Duration::from_secs(210),
            poll_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Terminal(JobStatus),
    InFlight,
    /// Another consumer started the attempt first.
    LostRace,
    /// The job left this attempt's RUNNING state while it was executing.
    StateChanged,
    /// Stale recovery handed the job to a newer attempt while this one was
    /// still executing.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Skipped(SkipReason),
    Succeeded,
    Retrying { attempt: u32, delay: Duration },
    Failed { attempt: u32, error: String },
}

struct ModelOutput {
    parsed: ParsedOutput,
    model_name: String,
    model_version: Option<String>,
}

#[derive(Clone)]
pub struct GradingWorker {
    stores: StoreSet,
    snapshots: SnapshotResolver,
    queue: Arc<dyn DispatchQueue>,
    invoker: Arc<dyn GradingInvoker>,
    retry: RetryScheduler,
    settings: WorkerSettings,
}

impl GradingWorker {
    pub fn new(
        stores: StoreSet,
        queue: Arc<dyn DispatchQueue>,
        invoker: Arc<dyn GradingInvoker>,
        retry: RetryScheduler,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            snapshots: SnapshotResolver::new(stores.snapshots.clone()),
            stores,
            queue,
            invoker,
            retry,
            settings,
        }
    }

    /// Consume job ids until `shutdown` flips to true. An in-flight job is
    /// always finished before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_wait_ms = self.settings.poll_wait.as_millis() as u64,
            deadline_ms = self.settings.job_deadline.as_millis() as u64,
            "Grading worker started"
        );

        while !*shutdown.borrow() {
            match self.queue.dequeue(self.settings.poll_wait).await {
                Ok(Some(job_id)) => match self.handle_job(job_id).await {
                    Ok(outcome) => tracing::debug!(job_id = %job_id, ?outcome, "Job handled"),
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                        self.pause(&mut shutdown).await;
                    }
                },
                Ok(None) => tracing::trace!("No jobs available"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to dequeue job");
                    self.pause(&mut shutdown).await;
                }
            }
        }

        tracing::info!("Grading worker stopped");
    }

    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Execute one delivery of `job_id`.
    ///
    /// Only store failures while recording the outcome are returned as errors;
    /// everything that goes wrong inside the attempt is folded into the
    /// outcome.
    pub async fn handle_job(&self, job_id: Uuid) -> Result<JobOutcome, StoreError> {
        let Some(job) = self.stores.jobs.get_job(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Dequeued unknown job");
            return Ok(JobOutcome::Skipped(SkipReason::NotFound));
        };

        match job.status {
            status if status.is_terminal() => {
                tracing::debug!(job_id = %job_id, status = %status, "Ignoring redelivered terminal job");
                return Ok(JobOutcome::Skipped(SkipReason::Terminal(status)));
            }
            JobStatus::Running => {
                tracing::debug!(job_id = %job_id, "Ignoring redelivered job that is already running");
                return Ok(JobOutcome::Skipped(SkipReason::InFlight));
            }
            _ => {}
        }

        let max_attempts = self.retry.policy().max_attempts;
        let completed = job.attempts.max(0) as u32;
        if completed >= max_attempts {
            let error = PipelineError::RetryBudgetExceeded(max_attempts);
            let message = match &job.error {
                Some(last) => format!("{error}; last error: {last}"),
                None => error.to_string(),
            };
            return self.fail(&job, completed, &message).await;
        }

        let Some(running) = self.stores.jobs.begin_attempt(job_id, job.attempts).await? else {
            tracing::debug!(job_id = %job_id, "Job was claimed by another consumer");
            return Ok(JobOutcome::Skipped(SkipReason::LostRace));
        };
        let attempt = running.attempts.max(1) as u32;

        tracing::info!(
            job_id = %job_id,
            submission_version_id = %running.submission_version_id,
            attempt,
            max_attempts,
            "Starting grading attempt"
        );

        let deadline = self.settings.job_deadline;
        let result = match tokio::time::timeout(deadline, self.execute(&running)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::DeadlineExceeded(deadline)),
        };

        match result {
            Ok(()) => {
                metrics::counter!("grading_jobs_succeeded_total").increment(1);
                tracing::info!(job_id = %job_id, attempt, "Grading job succeeded");
                Ok(JobOutcome::Succeeded)
            }
            Err(PipelineError::Superseded(_)) => {
                tracing::warn!(job_id = %job_id, attempt, "Attempt superseded by a newer attempt; dropping its outcome");
                Ok(JobOutcome::Skipped(SkipReason::Superseded))
            }
            Err(error) => self.handle_failure(&running, attempt, error).await,
        }
    }

    async fn execute(&self, job: &GradingJob) -> Result<(), PipelineError> {
        // PREPARE_INPUT
        let payload = self
            .queue
            .get_payload(job.id)
            .await?
            .ok_or(PipelineError::MissingPayload)?;
        let submission = self
            .stores
            .submissions
            .get_submission(job.submission_version_id)
            .await?
            .ok_or(PipelineError::SubmissionNotFound(job.submission_version_id))?;
        let snapshot_id = job
            .assignment_snapshot_id
            .ok_or(PipelineError::SnapshotUnassigned)?;
        let question = self
            .snapshots
            .resolve(snapshot_id, submission.question_id)
            .await?;

        // CALL_MODEL
        self.advance(job, JobStage::CallModel).await?;
        self.stores
            .submissions
            .set_ai_status(submission.id, AiStatus::Running)
            .await?;

        let output = if auto_rule::applies_to(&question) {
            tracing::debug!(job_id = %job.id, question_type = %question.kind(), "Grading by rule");
            let parsed = auto_rule::grade(
                &question,
                submission.content_text.as_deref().unwrap_or(""),
                submission.answer_payload.as_ref(),
                payload.uncertainty_policy.min_confidence,
                payload.options.return_student_markdown,
            );
            self.advance(job, JobStage::ParseOutput).await?;
            ModelOutput {
                parsed,
                model_name: auto_rule::MODEL_NAME.to_string(),
                model_version: Some(auto_rule::MODEL_VERSION.to_string()),
            }
        } else {
            let request = GradingRequest {
                job_id: job.id,
                snapshot_id,
                submission: submission.clone(),
                question,
                payload,
            };
            let invocation = self.invoker.invoke(&request).await?;

            // PARSE_OUTPUT
            self.advance(job, JobStage::ParseOutput).await?;
            ModelOutput {
                parsed: parse_model_output(&invocation.output_text)?,
                model_name: invocation.model_name,
                model_version: invocation.model_version,
            }
        };

        // SAVE_RESULT
        self.advance(job, JobStage::SaveResult).await?;
        let inserted = self
            .stores
            .results
            .insert_result(&NewGradingResult {
                job_id: job.id,
                submission_version_id: submission.id,
                assignment_id: submission.assignment_id,
                assignment_snapshot_id: snapshot_id,
                model_name: output.model_name,
                model_version: output.model_version,
                output: output.parsed,
            })
            .await?;
        if !inserted {
            tracing::info!(job_id = %job.id, "Result already recorded by an earlier attempt");
        }

        if !self.stores.jobs.mark_succeeded(job.id, job.attempts).await? {
            return Err(PipelineError::Superseded(job.attempts.max(0) as u32));
        }
        self.stores
            .submissions
            .set_ai_status(submission.id, AiStatus::Success)
            .await?;
        self.discard_payload(job.id).await;
        Ok(())
    }

    /// Record the next stage, failing with `Superseded` once this attempt no
    /// longer owns the job.
    async fn advance(&self, job: &GradingJob, stage: JobStage) -> Result<(), PipelineError> {
        if self.stores.jobs.set_stage(job.id, job.attempts, stage).await? {
            Ok(())
        } else {
            Err(PipelineError::Superseded(job.attempts.max(0) as u32))
        }
    }

    async fn handle_failure(
        &self,
        job: &GradingJob,
        attempt: u32,
        error: PipelineError,
    ) -> Result<JobOutcome, StoreError> {
        let message = error.to_string();
        if !(error.is_retryable() && self.retry.policy().has_remaining(attempt)) {
            return self.fail(job, attempt, &message).await;
        }

        if !self
            .stores
            .jobs
            .return_to_queue(job.id, job.attempts, &message)
            .await?
        {
            tracing::warn!(job_id = %job.id, error = %message, "Job left RUNNING before it could be retried");
            return Ok(JobOutcome::Skipped(SkipReason::StateChanged));
        }
        self.stores
            .submissions
            .set_ai_status(job.submission_version_id, AiStatus::Pending)
            .await?;

        match self.retry.readmit(job.id, attempt).await {
            Ok(delay) => {
                metrics::counter!("grading_jobs_retried_total").increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Grading attempt failed, retry scheduled"
                );
                Ok(JobOutcome::Retrying { attempt, delay })
            }
            Err(e) => {
                let message = format!("{message}; retry could not be scheduled: {e}");
                self.fail(job, attempt, &message).await
            }
        }
    }

    async fn fail(
        &self,
        job: &GradingJob,
        attempt: u32,
        message: &str,
    ) -> Result<JobOutcome, StoreError> {
        if !self
            .stores
            .jobs
            .mark_failed(job.id, job.attempts, message)
            .await?
        {
            tracing::warn!(job_id = %job.id, "Job already left an active state; not marking failed");
            return Ok(JobOutcome::Skipped(SkipReason::StateChanged));
        }
        self.stores
            .submissions
            .set_ai_status(job.submission_version_id, AiStatus::Failed)
            .await?;
        self.discard_payload(job.id).await;

        metrics::counter!("grading_jobs_failed_total").increment(1);
        tracing::error!(job_id = %job.id, attempt, error = %message, "Grading job failed");
        Ok(JobOutcome::Failed {
            attempt,
            error: message.to_string(),
        })
    }

    async fn discard_payload(&self, job_id: Uuid) {
        if let Err(e) = self.queue.clear_payload(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to clear dispatch payload");
        }
    }
}
