//! In-process grading of objective questions.
//!
//! Single-choice, multi-choice, true/false and fill-in-the-blank questions
//! (or any question whose grading policy says `AUTO_RULE`) are scored by
//! comparing the student's answer to the standard answer, without calling the
//! external grader. The output has the same shape the grader emits.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::models::grading::{ParsedOutput, ScoredItem, ScoredResult, UncertaintyReason};
use crate::models::snapshot::{QuestionType, SnapshotQuestion};
use crate::services::invoker::DEFAULT_MIN_CONFIDENCE;

pub const MODEL_NAME: &str = "AUTO_RULE";
pub const MODEL_VERSION: &str = "auto-rule-v1";

const FALLBACK_MAX_SCORE: f64 = 10.0;
const EMPTY_ANSWER: &str = "[empty answer]";

/// Whether `question` is graded by rule instead of by the external grader.
pub fn applies_to(question: &SnapshotQuestion) -> bool {
    question.grading_mode().as_deref() == Some("AUTO_RULE") || question.kind().is_objective()
}

#[derive(Debug, Clone, PartialEq)]
enum Answer {
    Choice(String),
    Choices(Vec<String>),
    Judgement(bool),
    Blanks(Vec<String>),
    Free(Value),
}

struct Comparison {
    ratio: f64,
    reason: String,
    uncertain: Option<String>,
}

impl Comparison {
    fn scored(ratio: f64, reason: impl Into<String>) -> Self {
        Self {
            ratio,
            reason: reason.into(),
            uncertain: None,
        }
    }

    fn ambiguous(reason: &str) -> Self {
        Self {
            ratio: 0.0,
            reason: reason.to_string(),
            uncertain: Some(reason.to_string()),
        }
    }
}

/// Score a student's answer against the question's standard answer.
pub fn grade(
    question: &SnapshotQuestion,
    answer_text: &str,
    answer_payload: Option<&Value>,
    min_confidence: Option<f64>,
    return_student_markdown: bool,
) -> ParsedOutput {
    let kind = question.kind();
    let min_confidence = clamp01(min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE));
    let standard = normalize(kind, question.standard_answer.as_ref(), "");
    let student = normalize(kind, answer_payload, answer_text);
    let allow_partial = question
        .question_schema
        .as_ref()
        .and_then(|s| s.get("allowPartial"))
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let mut reasons = Vec::new();
    if standard.is_none() {
        reasons.push(reason("MISSING_INFO", "standard answer has no gradable structure; teacher review advised"));
    }
    if student.is_none() {
        reasons.push(reason("MISSING_INFO", "student answer is empty or malformed"));
    }

    let comparison = match (&standard, &student) {
        (Some(expected), Some(actual)) => compare(expected, actual, allow_partial),
        _ => Comparison::scored(0.0, "graded by rule"),
    };
    if let Some(message) = &comparison.uncertain {
        reasons.push(reason("FORMAT_AMBIGUOUS", message));
    }

    let ratio = clamp01(comparison.ratio);
    let items = allocate(question, ratio, &comparison.reason);
    let total_score = round_to(items.iter().map(|i| i.score).sum(), 2);

    let confidence = estimate_confidence(ratio, standard.is_some(), student.is_some(), !reasons.is_empty());
    if confidence < min_confidence {
        reasons.push(reason(
            "LOW_CONFIDENCE",
            &format!("rule confidence {confidence:.2} is below threshold {min_confidence:.2}"),
        ));
    }
    let is_uncertain = !reasons.is_empty()
        || confidence < min_confidence
        || items.iter().any(|i| i.uncertainty_score >= 0.6);

    let result = ScoredResult {
        comment: comment(&comparison.reason, is_uncertain, &reasons),
        confidence: round_to(confidence, 3),
        is_uncertain,
        uncertainty_reasons: reasons,
        items,
        total_score,
    };

    let extracted = return_student_markdown.then(|| {
        let mut map = Map::new();
        map.insert(
            "studentMarkdown".to_string(),
            Value::String(student_markdown(student.as_ref(), answer_text)),
        );
        map
    });

    ParsedOutput {
        result: to_object(&result),
        extracted,
    }
}

fn to_object(result: &ScoredResult) -> Map<String, Value> {
    match serde_json::to_value(result) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn reason(code: &str, message: &str) -> UncertaintyReason {
    UncertaintyReason {
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn normalize(kind: QuestionType, payload: Option<&Value>, fallback: &str) -> Option<Answer> {
    match kind {
        QuestionType::Judge => extract_boolean(payload, fallback).map(Answer::Judgement),
        QuestionType::SingleChoice => extract_option_ids(payload, fallback)
            .into_iter()
            .next()
            .map(Answer::Choice),
        QuestionType::MultiChoice => {
            let mut seen = BTreeSet::new();
            let ids: Vec<String> = extract_option_ids(payload, fallback)
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect();
            (!ids.is_empty()).then_some(Answer::Choices(ids))
        }
        QuestionType::FillBlank => {
            let blanks = extract_blanks(payload, fallback);
            (!blanks.is_empty()).then_some(Answer::Blanks(blanks))
        }
        _ => match payload {
            Some(value) if !value.is_null() => Some(Answer::Free(value.clone())),
            _ => {
                let text = fallback.trim();
                (!text.is_empty()).then(|| Answer::Free(Value::String(text.to_string())))
            }
        },
    }
}

fn compare(expected: &Answer, actual: &Answer, allow_partial: bool) -> Comparison {
    match (expected, actual) {
        (Answer::Choice(expected), Answer::Choice(actual)) => {
            if expected.trim() == actual.trim() {
                Comparison::scored(1.0, format!("answer matches (standard: {expected})"))
            } else {
                Comparison::scored(
                    0.0,
                    format!("answer does not match (standard: {expected}, student: {actual})"),
                )
            }
        }
        (Answer::Judgement(expected), Answer::Judgement(actual)) => {
            if expected == actual {
                Comparison::scored(1.0, "judgement correct")
            } else {
                Comparison::scored(
                    0.0,
                    format!("judgement incorrect (standard: {})", if *expected { "true" } else { "false" }),
                )
            }
        }
        (Answer::Choices(expected), Answer::Choices(actual)) => {
            let expected: BTreeSet<String> = expected.iter().map(|v| normalize_token(v)).filter(|v| !v.is_empty()).collect();
            let actual: BTreeSet<String> = actual.iter().map(|v| normalize_token(v)).filter(|v| !v.is_empty()).collect();
            if expected.is_empty() {
                return Comparison::ambiguous("multi-choice question has no standard answer");
            }
            let hits = actual.intersection(&expected).count();
            let extra = actual.difference(&expected).count();
            let missed = expected.difference(&actual).count();
            if extra == 0 && missed == 0 {
                return Comparison::scored(1.0, "options match exactly");
            }
            if !allow_partial {
                return Comparison::scored(0.0, "options do not match exactly (no partial credit)");
            }
            let ratio = hits as f64 / (expected.len() + extra) as f64;
            Comparison::scored(
                ratio,
                format!("options partially match (hit {hits}, extra {extra}, missed {missed})"),
            )
        }
        (Answer::Blanks(expected), Answer::Blanks(actual)) => {
            let expected: Vec<String> = expected.iter().map(|v| normalize_token(v)).collect();
            if expected.is_empty() {
                return Comparison::ambiguous("fill-in-the-blank question has no standard answer");
            }
            let matched = expected
                .iter()
                .enumerate()
                .filter(|(i, want)| {
                    !want.is_empty() && actual.get(*i).map(|got| normalize_token(got)).as_ref() == Some(*want)
                })
                .count();
            if matched == expected.len() {
                return Comparison::scored(1.0, "all blanks correct");
            }
            if !allow_partial {
                return Comparison::scored(0.0, "not all blanks correct (no partial credit)");
            }
            Comparison::scored(
                matched as f64 / expected.len() as f64,
                format!("blanks partially correct ({matched}/{})", expected.len()),
            )
        }
        (Answer::Judgement(_), _) | (_, Answer::Judgement(_)) => {
            Comparison::ambiguous("true/false answer is malformed")
        }
        _ => Comparison::ambiguous("no grading rule configured for this question type"),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn split_tokens(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '，' | ';' | '；' | '、'))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_token(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn extract_option_ids(payload: Option<&Value>, fallback: &str) -> Vec<String> {
    if let Some(Value::Object(obj)) = payload {
        for key in ["selectedOptionIds", "selectedOptions", "optionIds", "options"] {
            if let Some(Value::Array(items)) = obj.get(key) {
                let ids: Vec<String> = items
                    .iter()
                    .map(value_text)
                    .filter(|id| !id.is_empty())
                    .collect();
                if !ids.is_empty() {
                    return ids;
                }
            }
        }
        for key in ["selectedOptionId", "selectedOption", "optionId", "value", "answer"] {
            if let Some(Value::String(id)) = obj.get(key) {
                if !id.trim().is_empty() {
                    return vec![id.trim().to_string()];
                }
            }
        }
    }
    if let Some(Value::Array(items)) = payload {
        return items.iter().map(value_text).filter(|id| !id.is_empty()).collect();
    }
    if let Some(Value::String(text)) = payload {
        if !text.trim().is_empty() {
            return split_tokens(text);
        }
    }
    split_tokens(fallback)
}

fn parse_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Some(true),
            Some(v) if v == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => parse_boolean_text(s),
        _ => None,
    }
}

fn parse_boolean_text(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" | "对" | "正确" => Some(true),
        "false" | "f" | "no" | "n" | "0" | "错" | "错误" => Some(false),
        _ => None,
    }
}

fn extract_boolean(payload: Option<&Value>, fallback: &str) -> Option<bool> {
    if let Some(Value::Object(obj)) = payload {
        for key in ["value", "answer", "isTrue", "correct"] {
            if let Some(parsed) = obj.get(key).and_then(parse_boolean) {
                return Some(parsed);
            }
        }
    }
    payload
        .and_then(parse_boolean)
        .or_else(|| parse_boolean_text(fallback))
}

fn extract_blanks(payload: Option<&Value>, fallback: &str) -> Vec<String> {
    if let Some(Value::Object(obj)) = payload {
        for key in ["blanks", "answers", "values"] {
            if let Some(Value::Array(items)) = obj.get(key) {
                return items
                    .iter()
                    .map(value_text)
                    .filter(|b| !b.is_empty())
                    .collect();
            }
        }
        if let Some(Value::String(single)) = obj.get("answer") {
            if !single.trim().is_empty() {
                return split_tokens(single);
            }
        }
    }
    if let Some(Value::Array(items)) = payload {
        return items.iter().map(value_text).filter(|b| !b.is_empty()).collect();
    }
    if let Some(Value::String(text)) = payload {
        if !text.trim().is_empty() {
            return split_tokens(text);
        }
    }
    split_tokens(fallback)
}

/// Spread `ratio` of each rubric item's maximum, correcting rounding drift on
/// the last item so the total equals `ratio` of the overall maximum.
fn allocate(question: &SnapshotQuestion, ratio: f64, reason: &str) -> Vec<ScoredItem> {
    let rubric: Vec<(String, f64)> = if question.rubric.is_empty() {
        let schema_max = question.question_schema.as_ref().and_then(|s| {
            s.get("maxScore")
                .and_then(Value::as_f64)
                .or_else(|| s.get("score").and_then(Value::as_f64))
        });
        vec![("AUTO_SCORE".to_string(), schema_max.unwrap_or(FALLBACK_MAX_SCORE))]
    } else {
        question
            .rubric
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let key = if item.rubric_item_key.is_empty() {
                    format!("AUTO_{}", i + 1)
                } else {
                    item.rubric_item_key.clone()
                };
                (key, item.max_score)
            })
            .collect()
    };

    let mut items: Vec<ScoredItem> = rubric
        .into_iter()
        .map(|(key, max)| ScoredItem {
            question_index: question.question_index,
            rubric_item_key: key,
            score: round_to(max.max(0.0) * ratio, 2),
            max_score: round_to(max, 2),
            reason: reason.to_string(),
            uncertainty_score: round_to(1.0 - ratio, 3),
        })
        .collect();

    let max_total = round_to(items.iter().map(|i| i.max_score).sum(), 2);
    let target = round_to(max_total * ratio, 2);
    let current = round_to(items.iter().map(|i| i.score).sum(), 2);
    let drift = round_to(target - current, 2);
    if drift != 0.0 {
        if let Some(last) = items.last_mut() {
            last.score = round_to((last.score + drift).clamp(0.0, last.max_score.max(0.0)), 2);
        }
    }
    items
}

fn estimate_confidence(ratio: f64, has_standard: bool, has_student: bool, has_reason: bool) -> f64 {
    if !has_standard || !has_student {
        0.25
    } else if has_reason {
        0.58
    } else if ratio >= 0.999 {
        0.97
    } else if ratio >= 0.8 {
        0.9
    } else if ratio >= 0.5 {
        0.82
    } else {
        0.72
    }
}

fn comment(reason: &str, is_uncertain: bool, reasons: &[UncertaintyReason]) -> String {
    let base = format!("Rule-based grading: {reason}.");
    if !is_uncertain {
        return format!("{base} Quick teacher review recommended before confirming.");
    }
    let details: Vec<String> = reasons
        .iter()
        .map(|r| format!("{}: {}", r.code, r.message))
        .collect();
    if details.is_empty() {
        format!("{base} Teacher confirmation required.")
    } else {
        format!("{base} Items need verification ({}); teacher confirmation required.", details.join("; "))
    }
}

fn student_markdown(answer: Option<&Answer>, fallback: &str) -> String {
    let fallback = fallback.trim();
    let or_empty = |s: String| {
        if !s.is_empty() {
            s
        } else if !fallback.is_empty() {
            fallback.to_string()
        } else {
            EMPTY_ANSWER.to_string()
        }
    };
    match answer {
        Some(Answer::Judgement(b)) => (if *b { "True" } else { "False" }).to_string(),
        Some(Answer::Choice(id)) => or_empty(id.trim().to_string()),
        Some(Answer::Choices(values)) | Some(Answer::Blanks(values)) => or_empty(values.join(", ")),
        Some(Answer::Free(Value::String(s))) => or_empty(s.trim().to_string()),
        Some(Answer::Free(other)) => {
            serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
        }
        None => or_empty(String::new()),
    }
}

fn clamp01(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
