//! Visit history models.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::encounter::TriggerType;

/// Where a visit entry came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisitSource {
    /// Generated from the visit recording
    Encounter,
    /// Entered or corrected by a clinician
    Manual,
    /// Imported from an attached document
    Imported,
}

impl VisitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitSource::Encounter => "encounter",
            VisitSource::Manual => "manual",
            VisitSource::Imported => "imported",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "encounter" => Some(VisitSource::Encounter),
            "manual" => Some(VisitSource::Manual),
            "imported" => Some(VisitSource::Imported),
            _ => None,
        }
    }
}

impl From<TriggerType> for VisitSource {
    fn from(trigger: TriggerType) -> Self {
        match trigger {
            TriggerType::RecordingComplete => VisitSource::Encounter,
            TriggerType::ManualEdit => VisitSource::Manual,
            TriggerType::AttachmentImport => VisitSource::Imported,
        }
    }
}

/// Tag describing what a visit entry changed on its problem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    NewProblem,
    VisitAdded,
    DiagnosisUpdated,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::NewProblem => "new_problem",
            ChangeKind::VisitAdded => "visit_added",
            ChangeKind::DiagnosisUpdated => "diagnosis_updated",
        }
    }
}

/// Clinical narrative snapshot of a problem as of one encounter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisitHistoryEntry {
    /// Storage position (0 until inserted)
    pub entry_id: i64,
    pub problem_id: String,
    pub encounter_id: String,
    /// Clinical date of the encounter, never the processing time
    pub date: String,
    pub notes: String,
    pub source: VisitSource,
    pub clinician_id: String,
    pub diagnosis_code_at_visit: Option<String>,
    pub change_kinds: Vec<ChangeKind>,
    /// Extraction confidence (0.0 - 1.0)
    pub confidence: f64,
    pub signed: bool,
    pub signed_at: Option<String>,
    pub signed_by: Option<String>,
    /// SHA-256 of the signed content, set at signing
    pub content_hash: Option<String>,
    /// When this entry was last written
    pub recorded_at: String,
}

/// Fields covered by the signing hash.
#[derive(Serialize)]
struct SignedContent<'a> {
    problem_id: &'a str,
    encounter_id: &'a str,
    date: &'a str,
    notes: &'a str,
    source: VisitSource,
    clinician_id: &'a str,
    diagnosis_code_at_visit: Option<&'a str>,
    change_kinds: &'a [ChangeKind],
    confidence: f64,
    signed_by: &'a str,
    signed_at: &'a str,
}

impl VisitHistoryEntry {
    /// Whether the entry is locked.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Add a change kind unless already present.
    pub fn add_change_kind(&mut self, kind: ChangeKind) {
        if !self.change_kinds.contains(&kind) {
            self.change_kinds.push(kind);
        }
    }

    /// Hash of the clinical content as it would be signed by `signed_by` at `signed_at`.
    pub fn signing_hash(&self, signed_by: &str, signed_at: &str) -> Result<String, serde_json::Error> {
        let content = SignedContent {
            problem_id: &self.problem_id,
            encounter_id: &self.encounter_id,
            date: &self.date,
            notes: &self.notes,
            source: self.source,
            clinician_id: &self.clinician_id,
            diagnosis_code_at_visit: self.diagnosis_code_at_visit.as_deref(),
            change_kinds: &self.change_kinds,
            confidence: self.confidence,
            signed_by,
            signed_at,
        };
        let payload = serde_json::to_string(&content)?;
        Ok(hex::encode(Sha256::digest(payload.as_bytes())))
    }

    /// Recompute the hash from the stored signature fields and compare.
    ///
    /// Unsigned entries never verify.
    pub fn verify_signature(&self) -> Result<bool, serde_json::Error> {
        match (&self.signed_by, &self.signed_at, &self.content_hash) {
            (Some(by), Some(at), Some(hash)) if self.signed => {
                Ok(&self.signing_hash(by, at)? == hash)
            }
            _ => Ok(false),
        }
    }
}
