//! Queries against collaborator tables: submission versions, assignments and
//! their snapshots. The pipeline only ever writes `ai_status` (and the
//! submission status it implies).

use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::snapshot::AssignmentSnapshot;
use crate::models::submission::{AiStatus, SubmissionVersion};

pub async fn get_submission(
    pool: &PgPool,
    submission_version_id: Uuid,
) -> Result<Option<SubmissionVersion>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, assignment_id, question_id, content_text, answer_payload,
               answer_format, file_url, ai_status
        FROM submission_versions
        WHERE id = $1
        "#,
    )
    .bind(submission_version_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let ai_status: String = r.try_get("ai_status")?;
    Ok(Some(SubmissionVersion {
        id: r.try_get("id")?,
        assignment_id: r.try_get("assignment_id")?,
        question_id: r.try_get("question_id")?,
        content_text: r.try_get("content_text")?,
        answer_payload: r.try_get("answer_payload")?,
        answer_format: r.try_get("answer_format")?,
        file_url: r.try_get("file_url")?,
        ai_status: parse_ai_status(&ai_status)?,
    }))
}

fn parse_ai_status(value: &str) -> Result<AiStatus, StoreError> {
    AiStatus::from_str(value)
        .map_err(|_| StoreError::Decode(format!("unknown ai status '{value}'")))
}

/// Mirror the grading status onto the submission. RUNNING and SUCCESS also
/// move the submission's own status forward.
pub async fn set_ai_status(
    pool: &PgPool,
    submission_version_id: Uuid,
    status: AiStatus,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE submission_versions
        SET ai_status = $2,
            status = CASE $2
                WHEN 'RUNNING' THEN 'AI_GRADING'
                WHEN 'SUCCESS' THEN 'AI_FINISHED'
                ELSE status
            END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(submission_version_id)
    .bind(status.as_ref())
    .execute(pool)
    .await?;

    Ok(())
}

/// Published snapshot of the assignment a submission belongs to
pub async fn current_snapshot_id(
    pool: &PgPool,
    submission_version_id: Uuid,
) -> Result<Option<Uuid>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT a.current_snapshot_id
        FROM submission_versions sv
        JOIN assignments a ON a.id = sv.assignment_id
        WHERE sv.id = $1
        "#,
    )
    .bind(submission_version_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => Ok(r.try_get::<Option<Uuid>, _>("current_snapshot_id")?),
        None => Ok(None),
    }
}

pub async fn get_snapshot(
    pool: &PgPool,
    snapshot_id: Uuid,
) -> Result<Option<AssignmentSnapshot>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, assignment_id, snapshot
        FROM assignment_snapshots
        WHERE id = $1
        "#,
    )
    .bind(snapshot_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    Ok(Some(AssignmentSnapshot {
        id: r.try_get("id")?,
        assignment_id: r.try_get("assignment_id")?,
        snapshot: r.try_get("snapshot")?,
    }))
}
