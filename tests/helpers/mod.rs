//! Shared test helpers: in-memory pipeline fixtures, a scripted grader, and
//! HTTP helpers for the end-to-end tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grading_pipeline::error::StoreError;
use grading_pipeline::models::job::{GradingJob, JobStage, JobStatus};
use grading_pipeline::models::payload::DispatchPayload;
use grading_pipeline::models::snapshot::AssignmentSnapshot;
use grading_pipeline::models::submission::{AiStatus, SubmissionVersion};
use grading_pipeline::services::invoker::{
    GradingInvoker, GradingRequest, InvocationOutput, InvokeError,
};
use grading_pipeline::services::jobs::JobService;
use grading_pipeline::services::queue::{DispatchQueue, MemoryDispatchQueue};
use grading_pipeline::services::retry::{RetryPolicy, RetryScheduler};
use grading_pipeline::services::worker::{GradingWorker, WorkerSettings};
use grading_pipeline::store::{JobStore, MemoryStore, StoreSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

pub const GOOD_OUTPUT: &str = r#"{"result":{"totalScore":7,"comment":"solid"},"extracted":{"studentMarkdown":"x = 2"}}"#;

/// One scripted grader response.
#[derive(Debug, Clone)]
pub enum Step {
    Output(String),
    Exit(i32),
    Hang,
}

/// Fake grader that replays a script, then keeps answering with
/// [`GOOD_OUTPUT`].
#[derive(Default)]
pub struct ScriptedInvoker {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail with a non-zero exit forever.
    pub fn always_failing() -> Self {
        Self::new(std::iter::repeat(Step::Exit(1)).take(64))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GradingInvoker for ScriptedInvoker {
    async fn invoke(&self, request: &GradingRequest) -> Result<InvocationOutput, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Step::Output(GOOD_OUTPUT.to_string()));
        tokio::task::yield_now().await;

        match step {
            Step::Output(text) => Ok(InvocationOutput {
                output_text: text,
                model_name: request
                    .payload
                    .model_hint
                    .as_ref()
                    .map_or_else(|| "scripted".to_string(), |h| h.name.clone()),
                model_version: Some("test".to_string()),
            }),
            Step::Exit(code) => Err(InvokeError::NonZeroExit {
                code: Some(code),
                stderr: "scripted failure".to_string(),
            }),
            Step::Hang => {
                sleep(Duration::from_secs(3600)).await;
                Err(InvokeError::MissingOutput)
            }
        }
    }
}

/// Job store that yields to the scheduler after every read, so concurrent
/// consumers all observe a job before any of them claims it.
pub struct YieldingJobStore {
    inner: Arc<MemoryStore>,
}

impl YieldingJobStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl JobStore for YieldingJobStore {
    async fn insert_job(
        &self,
        submission_version_id: Uuid,
        assignment_snapshot_id: Option<Uuid>,
    ) -> Result<GradingJob, StoreError> {
        self.inner
            .insert_job(submission_version_id, assignment_snapshot_id)
            .await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GradingJob>, StoreError> {
        let job = self.inner.get_job(job_id).await;
        tokio::task::yield_now().await;
        job
    }

    async fn latest_job_for_submission(
        &self,
        submission_version_id: Uuid,
    ) -> Result<Option<GradingJob>, StoreError> {
        self.inner.latest_job_for_submission(submission_version_id).await
    }

    async fn begin_attempt(
        &self,
        job_id: Uuid,
        observed_attempts: i32,
    ) -> Result<Option<GradingJob>, StoreError> {
        self.inner.begin_attempt(job_id, observed_attempts).await
    }

    async fn set_stage(
        &self,
        job_id: Uuid,
        attempt: i32,
        stage: JobStage,
    ) -> Result<bool, StoreError> {
        self.inner.set_stage(job_id, attempt, stage).await
    }

    async fn mark_succeeded(&self, job_id: Uuid, attempt: i32) -> Result<bool, StoreError> {
        self.inner.mark_succeeded(job_id, attempt).await
    }

    async fn return_to_queue(
        &self,
        job_id: Uuid,
        attempt: i32,
        error: &str,
    ) -> Result<bool, StoreError> {
        self.inner.return_to_queue(job_id, attempt, error).await
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        attempt: i32,
        error: &str,
    ) -> Result<bool, StoreError> {
        self.inner.mark_failed(job_id, attempt, error).await
    }

    async fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<GradingJob>, StoreError> {
        self.inner.find_stale_running(cutoff, limit).await
    }

    async fn recover_stale(
        &self,
        job_id: Uuid,
        cutoff: DateTime<Utc>,
        note: &str,
    ) -> Result<bool, StoreError> {
        self.inner.recover_stale(job_id, cutoff, note).await
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        self.inner.count_by_status().await
    }
}

pub fn submission(assignment_id: Uuid, question_id: Uuid, text: &str) -> SubmissionVersion {
    SubmissionVersion {
        id: Uuid::new_v4(),
        assignment_id,
        question_id,
        content_text: Some(text.to_string()),
        answer_payload: None,
        answer_format: Some("text".to_string()),
        file_url: String::new(),
        ai_status: AiStatus::Pending,
    }
}

pub fn essay_question(question_id: Uuid) -> Value {
    json!({
        "questionId": question_id.to_string(),
        "questionIndex": 1,
        "questionType": "ESSAY",
        "prompt": { "text": "Solve x + 1 = 3" },
        "standardAnswer": "x = 2",
        "rubric": [{ "rubricItemKey": "R1", "maxScore": 10, "criteria": "correct value" }]
    })
}

pub fn judge_question(question_id: Uuid, answer: bool) -> Value {
    json!({
        "questionId": question_id.to_string(),
        "questionIndex": 2,
        "questionType": "JUDGE",
        "standardAnswer": answer,
        "rubric": [{ "rubricItemKey": "J1", "maxScore": 2 }]
    })
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(60),
    }
}

/// A complete in-memory pipeline: stores, queue, producer and one worker.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryDispatchQueue>,
    pub invoker: Arc<ScriptedInvoker>,
    pub jobs: JobService,
    pub worker: GradingWorker,
    pub assignment_id: Uuid,
    pub question_id: Uuid,
    pub snapshot_id: Uuid,
}

impl Harness {
    pub fn new(invoker: ScriptedInvoker) -> Self {
        Self::with_settings(invoker, WorkerSettings::default())
    }

    pub fn with_settings(invoker: ScriptedInvoker, settings: WorkerSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryDispatchQueue::default());
        let invoker = Arc::new(invoker);
        let stores = StoreSet::shared(store.clone());
        let dyn_queue: Arc<dyn DispatchQueue> = queue.clone();

        let jobs = JobService::new(stores.clone(), dyn_queue.clone(), Duration::from_secs(300));
        let worker = GradingWorker::new(
            stores,
            dyn_queue.clone(),
            invoker.clone(),
            RetryScheduler::new(dyn_queue, fast_policy()),
            settings,
        );

        Self {
            store,
            queue,
            invoker,
            jobs,
            worker,
            assignment_id: Uuid::new_v4(),
            question_id: Uuid::new_v4(),
            snapshot_id: Uuid::new_v4(),
        }
    }

    /// Publish a snapshot holding `questions` as the assignment's current one.
    pub fn publish(&self, questions: Vec<Value>) {
        self.store.add_snapshot(AssignmentSnapshot {
            id: self.snapshot_id,
            assignment_id: self.assignment_id,
            snapshot: json!({ "questions": questions }),
        });
        self.store.publish_snapshot(self.assignment_id, self.snapshot_id);
    }

    pub fn add_submission(&self, text: &str) -> SubmissionVersion {
        let sub = submission(self.assignment_id, self.question_id, text);
        self.store.add_submission(sub.clone());
        sub
    }

    /// Create a job through the producer API and take its id off the queue.
    pub async fn create_and_take(&self, submission_id: Uuid, payload: DispatchPayload) -> Uuid {
        let job = self.jobs.create_job(submission_id, payload).await.unwrap();
        let delivered = self.take().await;
        assert_eq!(delivered, Some(job.id));
        job.id
    }

    pub async fn take(&self) -> Option<Uuid> {
        self.queue.dequeue(Duration::from_millis(10)).await.unwrap()
    }
}

// --- HTTP helpers for end-to-end tests ---

/// Response from POST /api/v1/submissions/{id}/grading
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// Response from GET /api/v1/jobs/{job_id}
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub stage: Option<String>,
    pub error: Option<String>,
    pub attempts: i32,
}

/// Submit a grading request for a submission version.
pub async fn create_grading_job(
    client: &reqwest::Client,
    base_url: &str,
    submission_version_id: Uuid,
    payload: &Value,
) -> Result<CreateJobResponse, Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/v1/submissions/{}/grading", base_url, submission_version_id))
        .json(payload)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Create failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<CreateJobResponse>().await?)
}

/// Poll job status until it reaches a terminal state (with timeout).
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
    timeout_secs: u64,
) -> Result<JobStatusResponse, Box<dyn std::error::Error>> {
    let max_polls = timeout_secs * 2; // Poll every 500ms

    for poll in 0..max_polls {
        let response = client
            .get(format!("{}/api/v1/jobs/{}", base_url, job_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let status = response.json::<JobStatusResponse>().await?;
        match status.status.as_str() {
            "SUCCEEDED" | "FAILED" => return Ok(status),
            "QUEUED" | "RUNNING" => {
                if poll % 10 == 0 && poll > 0 {
                    println!("  ... still waiting (poll {}/{})", poll, max_polls);
                }
                sleep(Duration::from_millis(500)).await;
            }
            other => return Err(format!("Unknown job status: {}", other).into()),
        }
    }

    Err(format!("Job did not finish within {} seconds", timeout_secs).into())
}
