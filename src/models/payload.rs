use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// How a job picks the assignment snapshot it grades against.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotPolicy {
    /// The assignment's most recently published snapshot.
    #[default]
    LatestPublished,
    /// The snapshot named by `assignment_snapshot_id`.
    Specific,
}

/// How harshly the grader applies the rubric.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GradingStrictness {
    Lenient,
    #[default]
    Balanced,
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ModelHint {
    #[garde(length(min = 1, max = 128))]
    pub name: String,

    #[garde(length(max = 64))]
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GradingOptions {
    /// Upper bound on pages (images) fed to the model for multi-page evidence.
    #[garde(range(min = 1, max = 32))]
    #[serde(default)]
    pub max_pages: Option<u32>,

    #[garde(range(min = 72, max = 600))]
    #[serde(default)]
    pub image_dpi: Option<u32>,

    /// Ask the grader to also transcribe the student's answer as markdown.
    #[garde(skip)]
    #[serde(default)]
    pub return_student_markdown: bool,

    #[garde(range(min = 0.0, max = 2.0))]
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Use the handwriting-focused grading prompt.
    #[garde(skip)]
    #[serde(default)]
    pub handwriting_recognition: bool,

    #[garde(skip)]
    #[serde(default)]
    pub grading_strictness: GradingStrictness,

    /// Free-text guidance from the course teacher, appended to the prompt.
    #[garde(length(max = 2000))]
    #[serde(default)]
    pub custom_guidance: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UncertaintyPolicy {
    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

/// Parameters the worker needs to execute a job. Stored in the dispatch
/// queue's payload store, keyed by job id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload {
    #[garde(skip)]
    #[serde(default)]
    pub snapshot_policy: SnapshotPolicy,

    #[garde(custom(required_for_specific(&self.snapshot_policy)))]
    #[serde(default)]
    pub assignment_snapshot_id: Option<Uuid>,

    #[garde(dive)]
    #[serde(default)]
    pub model_hint: Option<ModelHint>,

    #[garde(dive)]
    #[serde(default)]
    pub options: GradingOptions,

    #[garde(dive)]
    #[serde(default)]
    pub uncertainty_policy: UncertaintyPolicy,
}

fn required_for_specific(
    policy: &SnapshotPolicy,
) -> impl FnOnce(&Option<Uuid>, &()) -> garde::Result + '_ {
    move |value, _| match (policy, value) {
        (SnapshotPolicy::Specific, None) => Err(garde::Error::new(
            "assignmentSnapshotId is required when snapshotPolicy is SPECIFIC",
        )),
        _ => Ok(()),
    }
}
