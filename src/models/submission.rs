use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Grading status mirrored onto the submission record. The worker is the
/// only writer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AiStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// The submission-version fields the pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionVersion {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub question_id: Uuid,
    pub content_text: Option<String>,
    pub answer_payload: Option<serde_json::Value>,
    pub answer_format: Option<String>,
    /// Evidence file reference: a single path or a JSON array of paths.
    pub file_url: String,
    pub ai_status: AiStatus,
}
