//! Change log models.

use serde::{Deserialize, Serialize};

/// Why a problem record changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    VisitAdded,
    DiagnosisUpdated,
    ProblemCreated,
    ProblemResolved,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::VisitAdded => "visit_added",
            ChangeType::DiagnosisUpdated => "diagnosis_updated",
            ChangeType::ProblemCreated => "problem_created",
            ChangeType::ProblemResolved => "problem_resolved",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "visit_added" => Some(ChangeType::VisitAdded),
            "diagnosis_updated" => Some(ChangeType::DiagnosisUpdated),
            "problem_created" => Some(ChangeType::ProblemCreated),
            "problem_resolved" => Some(ChangeType::ProblemResolved),
            _ => None,
        }
    }
}

/// Audit record of one mutation of a problem. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeLogEntry {
    /// Storage position (0 until appended)
    pub log_id: i64,
    pub problem_id: String,
    pub encounter_id: String,
    pub timestamp: String,
    pub change_type: ChangeType,
    pub previous_code: Option<String>,
    pub next_code: Option<String>,
    /// Time spent applying the change
    pub processing_ms: u64,
}

impl ChangeLogEntry {
    pub fn new(
        problem_id: String,
        encounter_id: String,
        change_type: ChangeType,
        previous_code: Option<String>,
        next_code: Option<String>,
        processing_ms: u64,
    ) -> Self {
        Self {
            log_id: 0,
            problem_id,
            encounter_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            change_type,
            previous_code,
            next_code,
            processing_ms,
        }
    }
}
