//! Problem change extraction from raw oracle output.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::contract::{
    ChangeAction, DiagnosisCodeChange, ProblemChange, RawChange, RawOracleResponse,
};

/// Extraction errors.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid response format: {0}")]
    InvalidFormat(String),

    #[error("Oracle inference error: {0}")]
    Inference(String),

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle timed out after {0:?}")]
    Timeout(Duration),
}

pub type ExtractionResult<T> = Result<T, ExtractionError>;

/// A response entry that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedChange {
    /// Position in the oracle's `changes` array
    pub index: usize,
    pub reason: String,
}

/// Outcome of parsing one oracle response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChanges {
    pub changes: Vec<ProblemChange>,
    pub dropped: Vec<DroppedChange>,
}

/// Parse raw oracle text into validated changes.
///
/// The first well-formed JSON object in `raw` is taken as the response; prose
/// and code fences around it are ignored. Entries that fail validation are
/// dropped individually and reported in [`ParsedChanges::dropped`].
pub fn parse_oracle_response(raw: &str) -> ExtractionResult<ParsedChanges> {
    let object = first_json_object(raw).ok_or_else(|| {
        ExtractionError::InvalidFormat("No JSON object found in response".into())
    })?;
    let response: RawOracleResponse = serde_json::from_value(object)?;

    let mut parsed = ParsedChanges::default();
    for (index, value) in response.changes.into_iter().enumerate() {
        let validated = serde_json::from_value::<RawChange>(value)
            .map_err(|e| format!("entry does not match change schema: {e}"))
            .and_then(validate_change);

        match validated {
            Ok(change) => parsed.changes.push(change),
            Err(reason) => {
                warn!(index, %reason, "dropping malformed oracle change");
                parsed.dropped.push(DroppedChange { index, reason });
            }
        }
    }

    Ok(parsed)
}

/// Find the first `{` from which a complete JSON object can be read.
fn first_json_object(raw: &str) -> Option<Value> {
    raw.match_indices('{').find_map(|(start, _)| {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value @ Value::Object(_))) => Some(value),
            _ => None,
        }
    })
}

/// Re-validate the required fields of an untrusted change.
pub fn validate_change(raw: RawChange) -> Result<ProblemChange, String> {
    let action_name = raw.action.as_deref().unwrap_or("");
    let action = ChangeAction::parse(action_name)
        .ok_or_else(|| format!("unknown action {:?}", action_name))?;

    let target_problem_id = match raw.problem_id {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => non_empty(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => return Err(format!("problem_id has unsupported type: {other}")),
    };

    let proposed_title = raw.problem_title.and_then(non_empty);
    let visit_notes = raw.visit_notes.and_then(non_empty);
    let confidence = parse_confidence(raw.confidence)?;

    let diagnosis_code_change = match raw.icd10_change {
        Some(code) => match code.to.and_then(non_empty) {
            Some(to) => Some(DiagnosisCodeChange {
                from: code.from.and_then(non_empty),
                to,
            }),
            None if action == ChangeAction::UpdateIcd => {
                return Err("UPDATE_ICD requires icd10_change.to".into())
            }
            None => None,
        },
        None if action == ChangeAction::UpdateIcd => {
            return Err("UPDATE_ICD requires icd10_change".into())
        }
        None => None,
    };

    let target_problem_id = if action.requires_target() {
        Some(target_problem_id.ok_or_else(|| {
            format!("{} requires a problem_id", action.as_str())
        })?)
    } else {
        if proposed_title.is_none() {
            return Err("NEW_PROBLEM requires a non-empty problem_title".into());
        }
        None
    };

    Ok(ProblemChange {
        target_problem_id,
        action,
        proposed_title,
        visit_notes,
        diagnosis_code_change,
        confidence,
    })
}

fn parse_confidence(value: Option<Value>) -> Result<f64, String> {
    let confidence = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| "confidence must be a number".to_string())?;

    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence {confidence} outside 0..1"));
    }
    Ok(confidence)
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
