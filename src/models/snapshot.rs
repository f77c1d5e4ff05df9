use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Immutable copy of an assignment's questions frozen at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub snapshot: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum QuestionType {
    SingleChoice,
    MultiChoice,
    Judge,
    FillBlank,
    ShortAnswer,
    Essay,
    Calculation,
    Proof,
}

impl QuestionType {
    /// Objective types can be scored by rule without calling a model.
    pub fn is_objective(self) -> bool {
        matches!(
            self,
            QuestionType::SingleChoice
                | QuestionType::MultiChoice
                | QuestionType::Judge
                | QuestionType::FillBlank
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RubricItem {
    pub rubric_item_key: String,
    #[serde(default)]
    pub max_score: f64,
    #[serde(default)]
    pub criteria: String,
}

/// One question as stored inside a snapshot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotQuestion {
    pub question_id: String,
    #[serde(default = "default_question_index")]
    pub question_index: i64,
    #[serde(default)]
    pub question_type: Option<String>,
    #[serde(default)]
    pub question_schema: Option<Value>,
    #[serde(default)]
    pub grading_policy: Option<Value>,
    #[serde(default)]
    pub prompt: Option<Value>,
    #[serde(default)]
    pub standard_answer: Option<Value>,
    #[serde(default)]
    pub rubric: Vec<RubricItem>,
}

fn default_question_index() -> i64 {
    1
}

impl SnapshotQuestion {
    /// Question type, defaulting to short answer when absent or unknown.
    pub fn kind(&self) -> QuestionType {
        self.question_type
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(QuestionType::ShortAnswer)
    }

    pub fn prompt_text(&self) -> String {
        text_of(self.prompt.as_ref())
    }

    pub fn standard_answer_text(&self) -> String {
        text_of(self.standard_answer.as_ref())
    }

    /// `gradingPolicy.mode`, upper-cased.
    pub fn grading_mode(&self) -> Option<String> {
        self.grading_policy
            .as_ref()
            .and_then(|policy| policy.get("mode"))
            .and_then(Value::as_str)
            .map(str::to_uppercase)
    }
}

/// Flatten a prompt or answer field (`"text"`, `{ "text": ".." }` or any other
/// JSON) into plain text.
pub fn text_of(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => match other.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_question_defaults() {
        let q: SnapshotQuestion = serde_json::from_value(json!({ "questionId": "q1" })).unwrap();
        assert_eq!(q.question_index, 1);
        assert_eq!(q.kind(), QuestionType::ShortAnswer);
        assert!(q.rubric.is_empty());
        assert_eq!(q.prompt_text(), "");
    }

    #[test]
    fn test_text_extraction() {
        assert_eq!(text_of(Some(&json!("plain"))), "plain");
        assert_eq!(text_of(Some(&json!({ "text": "wrapped" }))), "wrapped");
        assert_eq!(text_of(Some(&json!({ "options": ["A"] }))), r#"{"options":["A"]}"#);
    }

    #[test]
    fn test_question_type_parsing() {
        let q: SnapshotQuestion = serde_json::from_value(json!({
            "questionId": "q2",
            "questionType": "multi_choice",
            "gradingPolicy": { "mode": "auto_rule" }
        }))
        .unwrap();
        assert_eq!(q.kind(), QuestionType::MultiChoice);
        assert!(q.kind().is_objective());
        assert_eq!(q.grading_mode().as_deref(), Some("AUTO_RULE"));
    }
}
