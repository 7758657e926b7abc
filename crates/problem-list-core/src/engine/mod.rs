//! Consolidation engine.
//!
//! Pipeline: Encounter Context → Oracle → Parse/Validate → Consolidate → Apply
//!
//! One oracle call is made per note, then the validated changes are applied
//! sequentially. Oracle failures degrade to an empty batch; only failing to
//! read the problem store at all is a hard error.

mod applier;
mod consolidate;
mod extract;

pub use applier::{ChangeApplier, VisitContext};
pub use consolidate::{consolidate, normalize_title, ConsolidationContext, Decision};
pub use extract::{build_request, call_oracle};

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use problem_list_llm::{parse_oracle_response, ExtractionOracle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::db::{Database, DbError, EncounterContextProvider};
use crate::models::{ChangeAction, ProblemChange, TriggerType, VisitSource};

/// Hard failures of a processing run.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Problem store unavailable: {0}")]
    Store(#[from] DbError),

    #[error("Encounter not found: {0}")]
    EncounterNotFound(String),

    #[error("Encounter {0} has no clinical date")]
    MissingClinicalDate(String),

    #[error("Encounter {encounter_id} belongs to patient {actual}, not {expected}")]
    PatientMismatch {
        encounter_id: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Why a proposed change was not applied.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("malformed change: {detail}")]
    Malformed { detail: String },

    #[error("unknown problem {problem_id}")]
    UnresolvedReference { problem_id: String },

    #[error("entry for problem {problem_id} in encounter {encounter_id} is signed")]
    SignedEntryConflict {
        problem_id: String,
        encounter_id: String,
    },

    #[error("encounter {encounter_id} is signed")]
    EncounterSigned { encounter_id: String },

    #[error("problem {problem_id} was resolved by another encounter")]
    ProblemResolved { problem_id: String },

    #[error("confidence {confidence} below minimum {minimum}")]
    LowConfidence { confidence: f64, minimum: f64 },

    #[error("store write failed: {detail}")]
    StoreWriteFailure { detail: String },
}

impl RejectionReason {
    /// Stable snake_case name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            RejectionReason::Malformed { .. } => "malformed",
            RejectionReason::UnresolvedReference { .. } => "unresolved_reference",
            RejectionReason::SignedEntryConflict { .. } => "signed_entry_conflict",
            RejectionReason::EncounterSigned { .. } => "encounter_signed",
            RejectionReason::ProblemResolved { .. } => "problem_resolved",
            RejectionReason::LowConfidence { .. } => "low_confidence",
            RejectionReason::StoreWriteFailure { .. } => "store_write_failure",
        }
    }
}

/// What applying a change did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOutcome {
    /// New problem with its first entry
    Created,
    /// New entry appended to an existing problem
    EntryAppended,
    /// The encounter's unsigned entry rewritten in place
    EntryReplaced,
    Resolved,
    /// Nothing to do, e.g. resolving an already resolved problem
    Unchanged,
}

impl ChangeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOutcome::Created => "created",
            ChangeOutcome::EntryAppended => "entry_appended",
            ChangeOutcome::EntryReplaced => "entry_replaced",
            ChangeOutcome::Resolved => "resolved",
            ChangeOutcome::Unchanged => "unchanged",
        }
    }

    /// Whether a visit entry for the encounter was written.
    pub fn wrote_entry(&self) -> bool {
        matches!(
            self,
            ChangeOutcome::Created | ChangeOutcome::EntryAppended | ChangeOutcome::EntryReplaced
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub problem_id: String,
    pub action: ChangeAction,
    pub outcome: ChangeOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedChange {
    /// Position in the oracle's `changes` array
    pub index: usize,
    pub action: Option<ChangeAction>,
    pub target_problem_id: Option<String>,
    pub reason: RejectionReason,
}

/// Outcome of processing one encounter note.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub changes: Vec<AppliedChange>,
    pub rejected: Vec<RejectedChange>,
    pub processing_time_ms: u64,
    /// Distinct problems actually modified
    pub problems_affected: u32,
    /// Set when the oracle could not be used and no changes were extracted
    pub degraded: Option<String>,
}

/// Runs the extraction and consolidation pipeline for encounter notes.
pub struct ConsolidationEngine<'a> {
    db: &'a Database,
    encounters: &'a dyn EncounterContextProvider,
    oracle: Arc<dyn ExtractionOracle>,
    config: &'a EngineConfig,
}

impl<'a> ConsolidationEngine<'a> {
    /// Engine reading encounters from the same database as the problems.
    pub fn new(db: &'a Database, oracle: Arc<dyn ExtractionOracle>, config: &'a EngineConfig) -> Self {
        Self {
            db,
            encounters: db,
            oracle,
            config,
        }
    }

    /// Use a different source of encounter context.
    pub fn with_encounter_provider(mut self, encounters: &'a dyn EncounterContextProvider) -> Self {
        self.encounters = encounters;
        self
    }

    /// Extract changes from `note_text` and merge them into the patient's problem list.
    pub fn process_encounter_note(
        &self,
        patient_id: &str,
        encounter_id: &str,
        note_text: &str,
        clinician_id: &str,
        trigger: TriggerType,
    ) -> EngineResult<ProcessingResult> {
        let started = Instant::now();

        for (name, value) in [
            ("patient_id", patient_id),
            ("encounter_id", encounter_id),
            ("note_text", note_text),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidInput(format!("{name} is empty")));
            }
        }

        self.db.ping()?;

        let encounter = self
            .encounters
            .encounter_context(encounter_id)?
            .ok_or_else(|| EngineError::EncounterNotFound(encounter_id.to_string()))?;
        if encounter.patient_id != patient_id {
            return Err(EngineError::PatientMismatch {
                encounter_id: encounter_id.to_string(),
                expected: patient_id.to_string(),
                actual: encounter.patient_id,
            });
        }
        let clinical_date = encounter
            .normalized_clinical_date()
            .ok_or_else(|| EngineError::MissingClinicalDate(encounter_id.to_string()))?;

        // Active problems, plus any this encounter resolved so replays see them
        let problems: Vec<_> = self
            .db
            .list_problems_for_patient(patient_id)?
            .into_iter()
            .filter(|p| p.is_active() || p.resolved_encounter_id.as_deref() == Some(encounter_id))
            .collect();
        let encounter_visits = self.db.encounter_visits_with_titles(patient_id, encounter_id)?;

        let request = build_request(
            &encounter,
            &clinical_date,
            &problems,
            &encounter_visits,
            note_text,
            trigger,
        );

        let mut result = ProcessingResult::default();

        let parsed = call_oracle(self.oracle.clone(), &request, self.config.oracle_timeout())
            .and_then(|raw| parse_oracle_response(&raw));
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    patient_id,
                    encounter_id,
                    reason = %e,
                    "oracle unusable, processing zero changes"
                );
                result.degraded = Some(e.to_string());
                result.processing_time_ms = elapsed_ms(started);
                return Ok(result);
            }
        };

        let dropped: HashSet<usize> = parsed.dropped.iter().map(|d| d.index).collect();
        for malformed in parsed.dropped {
            result.rejected.push(RejectedChange {
                index: malformed.index,
                action: None,
                target_problem_id: None,
                reason: RejectionReason::Malformed {
                    detail: malformed.reason,
                },
            });
        }

        // Valid changes keep the oracle's order; recover their original positions
        let positions = (0usize..).filter(|i| !dropped.contains(i));

        let clinician = if encounter.clinician_id.trim().is_empty() {
            clinician_id
        } else {
            encounter.clinician_id.as_str()
        };
        let mut applier = ChangeApplier::new(
            self.db,
            self.config,
            VisitContext {
                patient_id,
                encounter_id,
                encounter_signed: encounter.signed,
                clinical_date: &clinical_date,
                clinician_id: clinician,
                source: VisitSource::from(trigger),
            },
        );

        let mut affected = BTreeSet::new();
        for (index, change) in positions.zip(parsed.changes) {
            match applier.apply(&change) {
                Ok(applied) => {
                    if applied.outcome != ChangeOutcome::Unchanged {
                        affected.insert(applied.problem_id.clone());
                    }
                    result.changes.push(applied);
                }
                Err(reason) => {
                    log_rejection(patient_id, encounter_id, &change, &reason);
                    result.rejected.push(RejectedChange {
                        index,
                        action: Some(change.action),
                        target_problem_id: change.target_problem_id.clone(),
                        reason,
                    });
                }
            }
        }
        result.rejected.sort_by_key(|r| r.index);

        result.problems_affected = u32::try_from(affected.len()).unwrap_or(u32::MAX);
        result.processing_time_ms = elapsed_ms(started);

        info!(
            patient_id,
            encounter_id,
            trigger = trigger.as_str(),
            applied = result.changes.len(),
            rejected = result.rejected.len(),
            problems_affected = result.problems_affected,
            processing_time_ms = result.processing_time_ms,
            "processed encounter note"
        );

        Ok(result)
    }
}

fn log_rejection(
    patient_id: &str,
    encounter_id: &str,
    change: &ProblemChange,
    reason: &RejectionReason,
) {
    let problem_id = change.target_problem_id.as_deref().unwrap_or("-");
    match reason {
        RejectionReason::SignedEntryConflict { .. } | RejectionReason::EncounterSigned { .. } => error!(
            patient_id,
            encounter_id,
            problem_id,
            action = change.action.as_str(),
            reason = %reason,
            "change targets a signed encounter"
        ),
        RejectionReason::StoreWriteFailure { .. } => error!(
            patient_id,
            encounter_id,
            problem_id,
            action = change.action.as_str(),
            reason = %reason,
            "change could not be written"
        ),
        _ => warn!(
            patient_id,
            encounter_id,
            problem_id,
            action = change.action.as_str(),
            reason = %reason,
            "change rejected"
        ),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EncounterContext, Problem};
    use problem_list_llm::CannedOracle;
    use std::time::Duration;

    fn setup() -> (Database, Problem) {
        let db = Database::open_in_memory().unwrap();
        db.upsert_encounter(&EncounterContext::new(
            "enc-501".into(),
            "patient-1".into(),
            Some("2024-03-01".into()),
            "dr-lee".into(),
        ))
        .unwrap();

        let mut htn = Problem::new(
            "patient-1".into(),
            "Hypertension".into(),
            "2023-01-10".into(),
            "enc-100".into(),
        );
        htn.current_diagnosis_code = Some("I10".into());
        db.insert_problem(&htn).unwrap();
        (db, htn)
    }

    fn engine<'a>(
        db: &'a Database,
        oracle: CannedOracle,
        config: &'a EngineConfig,
    ) -> ConsolidationEngine<'a> {
        ConsolidationEngine::new(db, Arc::new(oracle), config)
    }

    #[test]
    fn test_add_visit_end_to_end() {
        let (db, htn) = setup();
        let config = EngineConfig::default();
        let reply = format!(
            r#"Here you go: ```json
            {{"changes": [{{"action": "ADD_VISIT", "problem_id": "{}", "visit_notes": "BP 150/95", "confidence": 0.9}}]}}
            ```"#,
            htn.problem_id
        );
        let engine = engine(&db, CannedOracle::always(reply), &config);

        let result = engine
            .process_encounter_note("patient-1", "enc-501", "BP high today", "dr-lee", TriggerType::RecordingComplete)
            .unwrap();

        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].outcome, ChangeOutcome::EntryAppended);
        assert_eq!(result.problems_affected, 1);
        assert!(result.degraded.is_none());

        let visits = db.visits_for_encounter("enc-501").unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].date, "2024-03-01");
        assert_eq!(visits[0].clinician_id, "dr-lee");
    }

    #[test]
    fn test_oracle_unavailable_degrades() {
        let (db, _) = setup();
        let config = EngineConfig::default();
        let engine = engine(&db, CannedOracle::unavailable("connection refused"), &config);

        let result = engine
            .process_encounter_note("patient-1", "enc-501", "note", "dr-lee", TriggerType::RecordingComplete)
            .unwrap();
        assert!(result.changes.is_empty());
        assert!(result.degraded.unwrap().contains("connection refused"));
    }

    #[test]
    fn test_oracle_timeout_degrades() {
        let (db, _) = setup();
        let config = EngineConfig::default()
            .with_oracle_timeout(Duration::from_millis(20))
            .unwrap();
        let oracle = CannedOracle::new().then(problem_list_llm::CannedReply::Delayed(
            Duration::from_millis(500),
            r#"{"changes": []}"#.into(),
        ));
        let engine = engine(&db, oracle, &config);

        let result = engine
            .process_encounter_note("patient-1", "enc-501", "note", "dr-lee", TriggerType::RecordingComplete)
            .unwrap();
        assert!(result.degraded.unwrap().contains("timed out"));
    }

    #[test]
    fn test_garbage_output_degrades() {
        let (db, _) = setup();
        let config = EngineConfig::default();
        let engine = engine(&db, CannedOracle::always("I could not find any changes."), &config);

        let result = engine
            .process_encounter_note("patient-1", "enc-501", "note", "dr-lee", TriggerType::ManualEdit)
            .unwrap();
        assert!(result.changes.is_empty());
        assert!(result.degraded.is_some());
    }

    #[test]
    fn test_rejections_keep_oracle_positions() {
        let (db, htn) = setup();
        let config = EngineConfig::default();
        let reply = format!(
            r#"{{"changes": [
                {{"action": "MERGE", "problem_id": "{id}", "confidence": 0.9}},
                {{"action": "ADD_VISIT", "problem_id": "ghost", "visit_notes": "x", "confidence": 0.9}},
                {{"action": "ADD_VISIT", "problem_id": "{id}", "visit_notes": "BP ok", "confidence": 0.9}}
            ]}}"#,
            id = htn.problem_id
        );
        let engine = engine(&db, CannedOracle::always(reply), &config);

        let result = engine
            .process_encounter_note("patient-1", "enc-501", "note", "dr-lee", TriggerType::RecordingComplete)
            .unwrap();

        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.rejected.len(), 2);
        assert_eq!(result.rejected[0].index, 0);
        assert!(matches!(result.rejected[0].reason, RejectionReason::Malformed { .. }));
        assert_eq!(result.rejected[1].index, 1);
        assert_eq!(
            result.rejected[1].reason,
            RejectionReason::UnresolvedReference {
                problem_id: "ghost".into()
            }
        );
    }

    #[test]
    fn test_input_errors() {
        let (db, _) = setup();
        db.upsert_encounter(&EncounterContext::new(
            "enc-undated".into(),
            "patient-1".into(),
            None,
            "dr-lee".into(),
        ))
        .unwrap();
        let config = EngineConfig::default();
        let engine = engine(&db, CannedOracle::always(r#"{"changes": []}"#), &config);
        let run = |patient: &str, encounter: &str, note: &str| {
            engine.process_encounter_note(patient, encounter, note, "dr-lee", TriggerType::RecordingComplete)
        };

        assert!(matches!(run("patient-1", "enc-404", "note"), Err(EngineError::EncounterNotFound(_))));
        assert!(matches!(run("patient-2", "enc-501", "note"), Err(EngineError::PatientMismatch { .. })));
        assert!(matches!(run("patient-1", "enc-undated", "note"), Err(EngineError::MissingClinicalDate(_))));
        assert!(matches!(run("patient-1", "enc-501", "  "), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn test_custom_encounter_provider() {
        struct Fixed(EncounterContext);
        impl EncounterContextProvider for Fixed {
            fn encounter_context(&self, encounter_id: &str) -> Result<Option<EncounterContext>, DbError> {
                Ok(Some(self.0.clone()).filter(|e| e.encounter_id == encounter_id))
            }
        }

        let (db, _) = setup();
        let provider = Fixed(EncounterContext::new(
            "ext-1".into(),
            "patient-1".into(),
            Some("2024-04-02T09:15:00Z".into()),
            "dr-kim".into(),
        ));
        let config = EngineConfig::default();
        let reply = r#"{"changes": [{"action": "NEW_PROBLEM", "problem_id": null, "problem_title": "Gout", "confidence": 0.8}]}"#;
        let engine = engine(&db, CannedOracle::always(reply), &config).with_encounter_provider(&provider);

        let result = engine
            .process_encounter_note("patient-1", "ext-1", "note", "dr-kim", TriggerType::AttachmentImport)
            .unwrap();
        let problem = db.get_problem(&result.changes[0].problem_id).unwrap().unwrap();
        assert_eq!(problem.first_diagnosed_date, "2024-04-02");
        assert_eq!(problem.visit_history[0].source, VisitSource::Imported);
        assert_eq!(problem.visit_history[0].clinician_id, "dr-kim");
    }
}
