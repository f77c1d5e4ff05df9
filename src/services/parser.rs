use serde_json::{Map, Value};

use crate::models::grading::ParsedOutput;

/// Turn raw grader output into a canonical `{ result, extracted? }`.
///
/// The trimmed text is parsed directly first; failing that, the outermost
/// `{ ... }` span is parsed, which tolerates log noise around the document.
/// Only structure is checked here, never score ranges.
pub fn parse_model_output(raw: &str) -> Result<ParsedOutput, ParseError> {
    let trimmed = raw.trim();
    if let Some(object) = parse_object(trimmed) {
        return validate_shape(object);
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Some(object) = parse_object(&trimmed[start..=end]) {
                return validate_shape(object);
            }
        }
    }

    Err(ParseError::NotJson)
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

fn validate_shape(mut object: Map<String, Value>) -> Result<ParsedOutput, ParseError> {
    let result = match object.remove("result") {
        Some(Value::Object(result)) => result,
        _ => return Err(ParseError::MissingResult),
    };

    let extracted = match object.remove("extracted") {
        None | Some(Value::Null) => None,
        Some(Value::Object(extracted)) => Some(extracted),
        Some(_) => return Err(ParseError::InvalidExtracted),
    };

    Ok(ParsedOutput { result, extracted })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("output is not a JSON object")]
    NotJson,

    #[error("output has no `result` object")]
    MissingResult,

    #[error("output `extracted` field is not an object")]
    InvalidExtracted,
}
