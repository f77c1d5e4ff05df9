use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Structurally validated grader output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedOutput {
    pub result: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted: Option<Map<String, Value>>,
}

/// A grading result ready to be committed. Written at most once per job.
#[derive(Debug, Clone)]
pub struct NewGradingResult {
    pub job_id: Uuid,
    pub submission_version_id: Uuid,
    pub assignment_id: Uuid,
    pub assignment_snapshot_id: Uuid,
    pub model_name: String,
    pub model_version: Option<String>,
    pub output: ParsedOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelIdentity {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Immutable output of a successful job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub submission_version_id: Uuid,
    pub assignment_snapshot_id: Uuid,
    pub model: ModelIdentity,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// One rubric line of a rule-graded result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredItem {
    pub question_index: i64,
    pub rubric_item_key: String,
    pub score: f64,
    pub max_score: f64,
    pub reason: String,
    pub uncertainty_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UncertaintyReason {
    pub code: String,
    pub message: String,
}

/// Result document shape produced by rule grading; mirrors what the external
/// grader is expected to emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredResult {
    pub comment: String,
    pub confidence: f64,
    pub is_uncertain: bool,
    pub uncertainty_reasons: Vec<UncertaintyReason>,
    pub items: Vec<ScoredItem>,
    pub total_score: f64,
}
