//! Wire shapes exchanged with the delta extraction oracle.

use serde::{Deserialize, Serialize};

/// What caused an encounter note to be (re)processed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Recording of the visit finished and the note was generated
    RecordingComplete,
    /// A clinician edited the note by hand
    ManualEdit,
    /// A document attached to the encounter was imported
    AttachmentImport,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::RecordingComplete => "recording_complete",
            TriggerType::ManualEdit => "manual_edit",
            TriggerType::AttachmentImport => "attachment_import",
        }
    }
}

/// Request sent to the oracle for one encounter note.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OracleRequest {
    /// The patient's active problems
    pub current_problems: Vec<ProblemSummary>,
    /// Visit entries already recorded for this same encounter
    pub encounter_visits: Vec<EncounterVisit>,
    /// The note being processed
    pub note_text: String,
    /// Visit metadata
    pub encounter: EncounterMeta,
}

/// Compact view of an existing problem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProblemSummary {
    pub id: String,
    pub title: String,
    pub diagnosis_code: Option<String>,
    pub status: String,
}

/// A visit entry already written for the encounter being processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncounterVisit {
    pub problem_id: String,
    pub problem_title: String,
    pub visit_date: String,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncounterMeta {
    /// Clinical date of the encounter (YYYY-MM-DD)
    pub date: String,
    pub patient_age: Option<u32>,
    pub trigger_type: TriggerType,
}

/// Change operation kinds the oracle may propose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    NewProblem,
    AddVisit,
    UpdateIcd,
    Resolve,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::NewProblem => "NEW_PROBLEM",
            ChangeAction::AddVisit => "ADD_VISIT",
            ChangeAction::UpdateIcd => "UPDATE_ICD",
            ChangeAction::Resolve => "RESOLVE",
        }
    }

    /// Parse an action name leniently (case and surrounding whitespace are ignored).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW_PROBLEM" => Some(ChangeAction::NewProblem),
            "ADD_VISIT" => Some(ChangeAction::AddVisit),
            "UPDATE_ICD" => Some(ChangeAction::UpdateIcd),
            "RESOLVE" => Some(ChangeAction::Resolve),
            _ => None,
        }
    }

    /// Whether this action must reference an existing problem.
    pub fn requires_target(&self) -> bool {
        !matches!(self, ChangeAction::NewProblem)
    }
}

/// Diagnosis code transition carried by a change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosisCodeChange {
    pub from: Option<String>,
    pub to: String,
}

/// A validated change proposed by the oracle.
///
/// Structural checks have passed; whether `target_problem_id` actually exists
/// is decided later, against the problem store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProblemChange {
    /// `None` for NEW_PROBLEM
    pub target_problem_id: Option<String>,
    pub action: ChangeAction,
    pub proposed_title: Option<String>,
    pub visit_notes: Option<String>,
    pub diagnosis_code_change: Option<DiagnosisCodeChange>,
    /// Extraction confidence (0.0 - 1.0)
    pub confidence: f64,
}

/// Top-level oracle response before per-entry validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOracleResponse {
    pub changes: Vec<serde_json::Value>,
}

/// One change entry as the oracle wrote it. Every field is optional and untrusted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawChange {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, alias = "problemId")]
    pub problem_id: Option<serde_json::Value>,
    #[serde(default, alias = "problemTitle")]
    pub problem_title: Option<String>,
    #[serde(default, alias = "visitNotes")]
    pub visit_notes: Option<String>,
    #[serde(default, alias = "icd10Change")]
    pub icd10_change: Option<RawCodeChange>,
    #[serde(default)]
    pub confidence: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawCodeChange {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}
