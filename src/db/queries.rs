use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::grading::{GradingResult, ModelIdentity, NewGradingResult};
use crate::models::job::{GradingJob, JobStage, JobStatus};

const JOB_COLUMNS: &str = "id, submission_version_id, assignment_snapshot_id, status, stage, \
                           attempts, last_started_at, error, created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<GradingJob, StoreError> {
    let status: String = row.try_get("status")?;
    let stage: String = row.try_get("stage")?;

    Ok(GradingJob {
        id: row.try_get("id")?,
        submission_version_id: row.try_get("submission_version_id")?,
        assignment_snapshot_id: row.try_get("assignment_snapshot_id")?,
        status: JobStatus::from_str(&status)
            .map_err(|_| StoreError::Decode(format!("unknown job status '{status}'")))?,
        stage: JobStage::from_str(&stage)
            .map_err(|_| StoreError::Decode(format!("unknown job stage '{stage}'")))?,
        attempts: row.try_get("attempts")?,
        last_started_at: row.try_get("last_started_at")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new grading job in status `queued`
pub async fn create_job(
    pool: &PgPool,
    submission_version_id: Uuid,
    assignment_snapshot_id: Option<Uuid>,
) -> Result<GradingJob, StoreError> {
    let sql = format!(
        "INSERT INTO grading_jobs (submission_version_id, assignment_snapshot_id) \
         VALUES ($1, $2) RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(submission_version_id)
        .bind(assignment_snapshot_id)
        .fetch_one(pool)
        .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<GradingJob>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM grading_jobs WHERE id = $1");
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Most recently created job for a submission version
pub async fn latest_job_for_submission(
    pool: &PgPool,
    submission_version_id: Uuid,
) -> Result<Option<GradingJob>, StoreError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM grading_jobs \
         WHERE submission_version_id = $1 \
         ORDER BY created_at DESC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(submission_version_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Claim a queued job for a new attempt. Matches only while the job is still
/// queued with the attempt count the caller observed.
pub async fn begin_attempt(
    pool: &PgPool,
    job_id: Uuid,
    observed_attempts: i32,
) -> Result<Option<GradingJob>, StoreError> {
    let sql = format!(
        "UPDATE grading_jobs \
         SET status = 'running', \
             stage = 'prepare_input', \
             attempts = attempts + 1, \
             last_started_at = NOW(), \
             error = NULL, \
             updated_at = NOW() \
         WHERE id = $1 AND status = 'queued' AND attempts = $2 \
         RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(observed_attempts)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Update the stage of a running job, if `attempt` still owns it
pub async fn set_stage(
    pool: &PgPool,
    job_id: Uuid,
    attempt: i32,
    stage: JobStage,
) -> Result<bool, StoreError> {
    let done = sqlx::query(
        r#"
        UPDATE grading_jobs
        SET stage = $3, updated_at = NOW()
        WHERE id = $1 AND attempts = $2 AND status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(attempt)
    .bind(stage.as_ref())
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

pub async fn mark_succeeded(pool: &PgPool, job_id: Uuid, attempt: i32) -> Result<bool, StoreError> {
    let done = sqlx::query(
        r#"
        UPDATE grading_jobs
        SET status = 'succeeded', error = NULL, updated_at = NOW()
        WHERE id = $1 AND attempts = $2 AND status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(attempt)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

pub async fn return_to_queue(
    pool: &PgPool,
    job_id: Uuid,
    attempt: i32,
    error: &str,
) -> Result<bool, StoreError> {
    let done = sqlx::query(
        r#"
        UPDATE grading_jobs
        SET status = 'queued', stage = 'prepare_input', error = $3, updated_at = NOW()
        WHERE id = $1 AND attempts = $2 AND status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(attempt)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

pub async fn mark_failed(
    pool: &PgPool,
    job_id: Uuid,
    attempt: i32,
    error: &str,
) -> Result<bool, StoreError> {
    let done = sqlx::query(
        r#"
        UPDATE grading_jobs
        SET status = 'failed', error = $3, updated_at = NOW()
        WHERE id = $1 AND attempts = $2 AND status IN ('queued', 'running')
        "#,
    )
    .bind(job_id)
    .bind(attempt)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

/// Running jobs whose current attempt started before `cutoff`
pub async fn find_stale_running(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<GradingJob>, StoreError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM grading_jobs \
         WHERE status = 'running' AND last_started_at < $1 \
         ORDER BY last_started_at ASC LIMIT $2"
    );
    let rows = sqlx::query(&sql)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(job_from_row).collect()
}

pub async fn recover_stale(
    pool: &PgPool,
    job_id: Uuid,
    cutoff: DateTime<Utc>,
    note: &str,
) -> Result<bool, StoreError> {
    let done = sqlx::query(
        r#"
        UPDATE grading_jobs
        SET status = 'queued', stage = 'prepare_input', error = $3, updated_at = NOW()
        WHERE id = $1 AND status = 'running' AND last_started_at < $2
        "#,
    )
    .bind(job_id)
    .bind(cutoff)
    .bind(note)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(JobStatus, i64)>, StoreError> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM grading_jobs GROUP BY status")
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|r| -> Result<(JobStatus, i64), StoreError> {
            let status: String = r.try_get("status")?;
            let status = JobStatus::from_str(&status)
                .map_err(|_| StoreError::Decode(format!("unknown job status '{status}'")))?;
            Ok((status, r.try_get("count")?))
        })
        .collect()
}

/// Insert a grading result unless the job already has one
pub async fn insert_result(pool: &PgPool, result: &NewGradingResult) -> Result<bool, StoreError> {
    let extracted = result.output.extracted.clone().map(Value::Object);
    let done = sqlx::query(
        r#"
        INSERT INTO grading_results (
            job_id, submission_version_id, assignment_id, assignment_snapshot_id,
            model_name, model_version, result, extracted
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (job_id) DO NOTHING
        "#,
    )
    .bind(result.job_id)
    .bind(result.submission_version_id)
    .bind(result.assignment_id)
    .bind(result.assignment_snapshot_id)
    .bind(&result.model_name)
    .bind(result.model_version.as_deref())
    .bind(Value::Object(result.output.result.clone()))
    .bind(extracted)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

pub async fn latest_result_for_submission(
    pool: &PgPool,
    submission_version_id: Uuid,
) -> Result<Option<GradingResult>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, job_id, submission_version_id, assignment_snapshot_id,
               model_name, model_version, result, extracted, created_at
        FROM grading_results
        WHERE submission_version_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(submission_version_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    Ok(Some(GradingResult {
        id: r.try_get("id")?,
        job_id: r.try_get("job_id")?,
        submission_version_id: r.try_get("submission_version_id")?,
        assignment_snapshot_id: r.try_get("assignment_snapshot_id")?,
        model: ModelIdentity {
            name: r.try_get("model_name")?,
            version: r.try_get("model_version")?,
        },
        result: r.try_get("result")?,
        extracted: r.try_get("extracted")?,
        created_at: r.try_get("created_at")?,
    }))
}
