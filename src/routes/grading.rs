use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::grading::GradingResult;
use crate::models::job::{JobStatus, JobStatusView};
use crate::models::payload::DispatchPayload;
use crate::services::jobs::{JobServiceError, QueueOverview};
use crate::services::recovery::RecoveryReport;

/// Response after a grading job was accepted.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error half of every handler here: a status code plus `{ "error": .. }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: &str, id: Uuid) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("{what} {id} not found"),
        }
    }
}

impl From<JobServiceError> for ApiError {
    fn from(err: JobServiceError) -> Self {
        let status = match &err {
            JobServiceError::SubmissionNotFound(_) | JobServiceError::JobNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            JobServiceError::NotQueued(_) => StatusCode::CONFLICT,
            JobServiceError::Enqueue(_) => StatusCode::SERVICE_UNAVAILABLE,
            JobServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "Grading API request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// POST /api/v1/submissions/{id}/grading — queue a grading job.
pub async fn create_grading_job(
    State(state): State<AppState>,
    Path(submission_version_id): Path<Uuid>,
    Json(payload): Json<DispatchPayload>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    payload.validate().map_err(|report| ApiError {
        status: StatusCode::UNPROCESSABLE_ENTITY,
        message: report.to_string(),
    })?;

    let job = state.jobs.create_job(submission_version_id, payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /api/v1/submissions/{id}/grading/job — latest job of a submission.
pub async fn latest_job_status(
    State(state): State<AppState>,
    Path(submission_version_id): Path<Uuid>,
) -> Result<Json<JobStatusView>, ApiError> {
    state
        .jobs
        .latest_job_status(submission_version_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("grading job for submission", submission_version_id))
}

/// GET /api/v1/submissions/{id}/grading — latest grading result.
pub async fn latest_result(
    State(state): State<AppState>,
    Path(submission_version_id): Path<Uuid>,
) -> Result<Json<GradingResult>, ApiError> {
    state
        .jobs
        .latest_result(submission_version_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("grading result for submission", submission_version_id))
}

/// GET /api/v1/jobs/{job_id} — poll one job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>, ApiError> {
    state
        .jobs
        .job_status(job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("job", job_id))
}

/// POST /api/v1/jobs/{job_id}/requeue
pub async fn requeue_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobStatusView>), ApiError> {
    let view = state.jobs.requeue(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverParams {
    /// Overrides the configured stale threshold for this sweep.
    pub stale_seconds: Option<u64>,
}

/// POST /api/v1/jobs/recover-stale?staleSeconds=N
pub async fn recover_stale(
    State(state): State<AppState>,
    Query(params): Query<RecoverParams>,
) -> Result<Json<RecoveryReport>, ApiError> {
    let threshold = params.stale_seconds.map(Duration::from_secs);
    Ok(Json(state.jobs.recover_stale(threshold).await?))
}

/// GET /api/v1/queue/overview
pub async fn queue_overview(
    State(state): State<AppState>,
) -> Result<Json<QueueOverview>, ApiError> {
    Ok(Json(state.jobs.queue_overview().await?))
}
