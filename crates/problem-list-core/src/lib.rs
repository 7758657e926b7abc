//! Problem-List Core Library
//!
//! Incremental consolidation of clinical encounter notes into a patient's
//! longitudinal problem list.
//!
//! # Architecture
//!
//! ```text
//! Note text + encounter id
//!          │
//!          ▼
//!  Encounter Context ──► Delta Extraction Oracle (timeout-bounded)
//!                                   │
//!                        parse + validate (untrusted)
//!                                   │
//!                                   ▼
//!                         Consolidation Engine
//!                  (one history entry per problem per visit)
//!                                   │
//!                                   ▼
//!                 Change Applier ──► Problem Store (SQLite)
//!                                   ▲
//!                                   │
//!                  Signing Service (draft → signed, hashed)
//! ```
//!
//! # Core Principle
//!
//! **Reprocessing a visit never duplicates history.** An encounter's unsigned
//! entry is replaced in place; a signed one is never touched again.
//!
//! # Modules
//!
//! - [`db`]: SQLite problem store and encounter registry
//! - [`models`]: Domain types (Problem, VisitHistoryEntry, ChangeLogEntry, ...)
//! - [`engine`]: Oracle call, consolidation and change application
//! - [`signing`]: Encounter signing and signature audit
//! - [`config`]: Engine tunables
//! - [`logging`]: Tracing subscriber setup

pub mod config;
pub mod db;
pub mod engine;
pub mod logging;
pub mod models;
pub mod signing;

// Re-export commonly used types
pub use config::EngineConfig;
pub use db::{Database, EncounterContextProvider};
pub use engine::{
    AppliedChange, ChangeOutcome, ConsolidationEngine, EngineError, ProcessingResult,
    RejectedChange, RejectionReason,
};
pub use models::{
    ChangeLogEntry, EncounterContext, Problem, ProblemStatus, TriggerType, VisitHistoryEntry,
};
pub use signing::{SignatureAudit, SigningReport, SigningService};

pub use problem_list_llm::{ExtractionOracle, OracleRequest};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::sync::{Arc, Mutex};

use problem_list_llm::{ExtractionError, ExtractionResult};

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum ProblemListError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Oracle error: {0}")]
    OracleError(String),
}

impl From<db::DbError> for ProblemListError {
    fn from(e: db::DbError) -> Self {
        ProblemListError::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for ProblemListError {
    fn from(e: serde_json::Error) -> Self {
        ProblemListError::SerializationError(e.to_string())
    }
}

impl From<EngineError> for ProblemListError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Store(e) => ProblemListError::DatabaseError(e.to_string()),
            EngineError::EncounterNotFound(_) => ProblemListError::NotFound(e.to_string()),
            EngineError::MissingClinicalDate(_)
            | EngineError::PatientMismatch { .. }
            | EngineError::InvalidInput(_) => ProblemListError::InvalidInput(e.to_string()),
        }
    }
}

impl From<signing::SigningError> for ProblemListError {
    fn from(e: signing::SigningError) -> Self {
        match e {
            signing::SigningError::InvalidInput(msg) => ProblemListError::InvalidInput(msg),
            signing::SigningError::Json(e) => ProblemListError::SerializationError(e.to_string()),
            signing::SigningError::Store(e) => ProblemListError::DatabaseError(e.to_string()),
        }
    }
}

impl From<uniffi::UnexpectedUniFFICallbackError> for ProblemListError {
    fn from(e: uniffi::UnexpectedUniFFICallbackError) -> Self {
        ProblemListError::OracleError(e.reason)
    }
}

impl<T> From<std::sync::PoisonError<T>> for ProblemListError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ProblemListError::DatabaseError(format!("Lock poisoned: {}", e))
    }
}

// =========================================================================
// Foreign Oracle
// =========================================================================

/// Extraction service implemented by the host application.
///
/// Receives the oracle request as JSON and returns the raw model output.
#[uniffi::export(with_foreign)]
pub trait ForeignOracle: Send + Sync {
    fn extract_changes(&self, request_json: String) -> Result<String, ProblemListError>;
}

struct ForeignOracleAdapter {
    inner: Arc<dyn ForeignOracle>,
}

impl ExtractionOracle for ForeignOracleAdapter {
    fn extract_changes(&self, request: &OracleRequest) -> ExtractionResult<String> {
        let request_json = serde_json::to_string(request)?;
        self.inner
            .extract_changes(request_json)
            .map_err(|e| ExtractionError::Unavailable(e.to_string()))
    }
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

/// Open or create a database at the given path.
///
/// Engine settings are read from `PROBLEM_LIST_*` environment variables.
#[uniffi::export]
pub fn open_database(
    path: String,
    oracle: Arc<dyn ForeignOracle>,
) -> Result<Arc<ProblemListCore>, ProblemListError> {
    let config = EngineConfig::from_env()
        .map_err(|e| ProblemListError::InvalidInput(format!("{e:#}")))?;
    let db = Database::open(&path)?;
    Ok(Arc::new(ProblemListCore::new(db, oracle, config)))
}

/// Create an in-memory database with default settings (for testing).
#[uniffi::export]
pub fn open_database_in_memory(
    oracle: Arc<dyn ForeignOracle>,
) -> Result<Arc<ProblemListCore>, ProblemListError> {
    let db = Database::open_in_memory()?;
    Ok(Arc::new(ProblemListCore::new(db, oracle, EngineConfig::default())))
}

/// Install the tracing subscriber. Returns false if one was already installed.
#[uniffi::export]
pub fn init_logging(filter: Option<String>) -> bool {
    logging::init_logging(filter.as_deref().unwrap_or(logging::DEFAULT_FILTER))
}

// =========================================================================
// Main API Object
// =========================================================================

/// Thread-safe database wrapper for FFI.
#[derive(uniffi::Object)]
pub struct ProblemListCore {
    db: Arc<Mutex<Database>>,
    oracle: Arc<dyn ExtractionOracle>,
    config: EngineConfig,
}

impl ProblemListCore {
    fn new(db: Database, oracle: Arc<dyn ForeignOracle>, config: EngineConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            oracle: Arc::new(ForeignOracleAdapter { inner: oracle }),
            config,
        }
    }
}

#[uniffi::export]
impl ProblemListCore {
    // =========================================================================
    // Encounter Operations
    // =========================================================================

    /// Register or update an encounter before its notes are processed.
    pub fn register_encounter(&self, encounter: FfiEncounter) -> Result<(), ProblemListError> {
        let db = self.db.lock()?;
        db.upsert_encounter(&encounter.into())?;
        Ok(())
    }

    /// Extract and merge problem-list changes from an encounter note.
    pub fn process_encounter_note(
        &self,
        patient_id: String,
        encounter_id: String,
        note_text: String,
        clinician_id: String,
        trigger: FfiTriggerType,
    ) -> Result<FfiProcessingResult, ProblemListError> {
        let db = self.db.lock()?;
        let engine = ConsolidationEngine::new(&db, self.oracle.clone(), &self.config);
        let result = engine.process_encounter_note(
            &patient_id,
            &encounter_id,
            &note_text,
            &clinician_id,
            trigger.into(),
        )?;
        Ok(result.into())
    }

    /// Sign every draft entry of an encounter.
    pub fn sign_encounter(
        &self,
        encounter_id: String,
        clinician_id: String,
    ) -> Result<FfiSigningReport, ProblemListError> {
        let db = self.db.lock()?;
        let report = SigningService::new(&db).sign_encounter(&encounter_id, &clinician_id)?;
        Ok(report.into())
    }

    /// Recheck the content hashes of an encounter's signed entries.
    pub fn verify_encounter_signatures(
        &self,
        encounter_id: String,
    ) -> Result<FfiSignatureAudit, ProblemListError> {
        let db = self.db.lock()?;
        let audit = SigningService::new(&db).verify_encounter_signatures(&encounter_id)?;
        Ok(audit.into())
    }

    // =========================================================================
    // Problem Queries
    // =========================================================================

    /// List a patient's problems, optionally only the active ones.
    pub fn list_problems(
        &self,
        patient_id: String,
        active_only: bool,
    ) -> Result<Vec<FfiProblem>, ProblemListError> {
        let db = self.db.lock()?;
        let problems = if active_only {
            db.list_active_problems(&patient_id)?
        } else {
            db.list_problems_for_patient(&patient_id)?
        };
        Ok(problems.into_iter().map(|p| p.into()).collect())
    }

    /// Get a problem with its history and change log.
    pub fn get_problem(&self, problem_id: String) -> Result<Option<FfiProblem>, ProblemListError> {
        let db = self.db.lock()?;
        let problem = db.get_problem(&problem_id)?;
        Ok(problem.map(|p| p.into()))
    }

    /// Visit entries recorded for an encounter, across problems.
    pub fn list_encounter_visits(
        &self,
        encounter_id: String,
    ) -> Result<Vec<FfiVisitEntry>, ProblemListError> {
        let db = self.db.lock()?;
        let visits = db.visits_for_encounter(&encounter_id)?;
        Ok(visits.into_iter().map(|v| v.into()).collect())
    }
}

// =========================================================================
// FFI Types
// =========================================================================

#[derive(Debug, Clone, Copy, uniffi::Enum)]
pub enum FfiTriggerType {
    RecordingComplete,
    ManualEdit,
    AttachmentImport,
}

impl From<FfiTriggerType> for TriggerType {
    fn from(trigger: FfiTriggerType) -> Self {
        match trigger {
            FfiTriggerType::RecordingComplete => TriggerType::RecordingComplete,
            FfiTriggerType::ManualEdit => TriggerType::ManualEdit,
            FfiTriggerType::AttachmentImport => TriggerType::AttachmentImport,
        }
    }
}

/// FFI-safe encounter registration.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiEncounter {
    pub encounter_id: String,
    pub patient_id: String,
    /// `YYYY-MM-DD` or RFC 3339
    pub clinical_date: Option<String>,
    pub clinician_id: String,
    pub patient_age_years: Option<u32>,
}

impl From<FfiEncounter> for EncounterContext {
    fn from(enc: FfiEncounter) -> Self {
        let mut ctx = EncounterContext::new(
            enc.encounter_id,
            enc.patient_id,
            enc.clinical_date,
            enc.clinician_id,
        );
        ctx.patient_age_years = enc.patient_age_years;
        ctx
    }
}

/// FFI-safe processing outcome.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiProcessingResult {
    pub changes: Vec<FfiAppliedChange>,
    pub rejected: Vec<FfiRejectedChange>,
    pub processing_time_ms: u64,
    pub problems_affected: u32,
    pub degraded: Option<String>,
}

impl From<ProcessingResult> for FfiProcessingResult {
    fn from(result: ProcessingResult) -> Self {
        Self {
            changes: result.changes.into_iter().map(|c| c.into()).collect(),
            rejected: result.rejected.into_iter().map(|r| r.into()).collect(),
            processing_time_ms: result.processing_time_ms,
            problems_affected: result.problems_affected,
            degraded: result.degraded,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiAppliedChange {
    pub problem_id: String,
    pub action: String,
    pub outcome: String,
}

impl From<AppliedChange> for FfiAppliedChange {
    fn from(change: AppliedChange) -> Self {
        Self {
            problem_id: change.problem_id,
            action: change.action.as_str().to_string(),
            outcome: change.outcome.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiRejectedChange {
    pub index: u32,
    pub action: Option<String>,
    pub target_problem_id: Option<String>,
    /// Snake_case rejection kind, e.g. `signed_entry_conflict`
    pub reason_kind: String,
    pub detail: String,
}

impl From<RejectedChange> for FfiRejectedChange {
    fn from(rejected: RejectedChange) -> Self {
        Self {
            index: u32::try_from(rejected.index).unwrap_or(u32::MAX),
            action: rejected.action.map(|a| a.as_str().to_string()),
            target_problem_id: rejected.target_problem_id,
            reason_kind: rejected.reason.kind().to_string(),
            detail: rejected.reason.to_string(),
        }
    }
}

/// FFI-safe problem.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiProblem {
    pub problem_id: String,
    pub patient_id: String,
    pub title: String,
    pub current_diagnosis_code: Option<String>,
    pub status: String,
    pub first_diagnosed_date: String,
    pub first_encounter_id: String,
    pub last_updated_encounter_id: String,
    pub resolved_encounter_id: Option<String>,
    pub visit_history: Vec<FfiVisitEntry>,
    pub change_log: Vec<FfiChangeLogEntry>,
}

impl From<Problem> for FfiProblem {
    fn from(problem: Problem) -> Self {
        Self {
            problem_id: problem.problem_id,
            patient_id: problem.patient_id,
            title: problem.title,
            current_diagnosis_code: problem.current_diagnosis_code,
            status: problem.status.as_str().to_string(),
            first_diagnosed_date: problem.first_diagnosed_date,
            first_encounter_id: problem.first_encounter_id,
            last_updated_encounter_id: problem.last_updated_encounter_id,
            resolved_encounter_id: problem.resolved_encounter_id,
            visit_history: problem.visit_history.into_iter().map(|v| v.into()).collect(),
            change_log: problem.change_log.into_iter().map(|c| c.into()).collect(),
        }
    }
}

/// FFI-safe visit history entry.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiVisitEntry {
    pub problem_id: String,
    pub encounter_id: String,
    pub date: String,
    pub notes: String,
    pub source: String,
    pub clinician_id: String,
    pub diagnosis_code_at_visit: Option<String>,
    pub change_kinds: Vec<String>,
    pub confidence: f64,
    pub signed: bool,
    pub signed_at: Option<String>,
    pub signed_by: Option<String>,
}

impl From<VisitHistoryEntry> for FfiVisitEntry {
    fn from(entry: VisitHistoryEntry) -> Self {
        Self {
            problem_id: entry.problem_id,
            encounter_id: entry.encounter_id,
            date: entry.date,
            notes: entry.notes,
            source: entry.source.as_str().to_string(),
            clinician_id: entry.clinician_id,
            diagnosis_code_at_visit: entry.diagnosis_code_at_visit,
            change_kinds: entry
                .change_kinds
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
            confidence: entry.confidence,
            signed: entry.signed,
            signed_at: entry.signed_at,
            signed_by: entry.signed_by,
        }
    }
}

/// FFI-safe change log entry.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiChangeLogEntry {
    pub encounter_id: String,
    pub timestamp: String,
    pub change_type: String,
    pub previous_code: Option<String>,
    pub next_code: Option<String>,
    pub processing_ms: u64,
}

impl From<ChangeLogEntry> for FfiChangeLogEntry {
    fn from(entry: ChangeLogEntry) -> Self {
        Self {
            encounter_id: entry.encounter_id,
            timestamp: entry.timestamp,
            change_type: entry.change_type.as_str().to_string(),
            previous_code: entry.previous_code,
            next_code: entry.next_code,
            processing_ms: entry.processing_ms,
        }
    }
}

/// FFI-safe signing report.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSigningReport {
    pub entries_signed: u32,
    pub problems_touched: Vec<String>,
}

impl From<SigningReport> for FfiSigningReport {
    fn from(report: SigningReport) -> Self {
        Self {
            entries_signed: report.entries_signed,
            problems_touched: report.problems_touched,
        }
    }
}

/// FFI-safe signature audit.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSignatureAudit {
    pub verified: u32,
    pub mismatched: Vec<String>,
    pub unsigned: u32,
}

impl From<SignatureAudit> for FfiSignatureAudit {
    fn from(audit: SignatureAudit) -> Self {
        Self {
            verified: audit.verified,
            mismatched: audit.mismatched,
            unsigned: audit.unsigned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoOracle {
        reply: String,
    }

    impl ForeignOracle for EchoOracle {
        fn extract_changes(&self, request_json: String) -> Result<String, ProblemListError> {
            let request: OracleRequest = serde_json::from_str(&request_json)?;
            if request.note_text.is_empty() {
                return Err(ProblemListError::InvalidInput("empty note".into()));
            }
            Ok(self.reply.clone())
        }
    }

    fn core(reply: &str) -> Arc<ProblemListCore> {
        let core = open_database_in_memory(Arc::new(EchoOracle {
            reply: reply.into(),
        }))
        .unwrap();
        core.register_encounter(FfiEncounter {
            encounter_id: "enc-501".into(),
            patient_id: "patient-1".into(),
            clinical_date: Some("2024-03-01".into()),
            clinician_id: "dr-lee".into(),
            patient_age_years: Some(64),
        })
        .unwrap();
        core
    }

    #[test]
    fn test_process_sign_and_audit_through_ffi() {
        let core = core(
            r#"{"changes": [{"action": "NEW_PROBLEM", "problem_id": null, "problem_title": "Hypertension",
                 "visit_notes": "BP 150/95", "icd10_change": {"from": null, "to": "I10"}, "confidence": 0.9}]}"#,
        );

        let result = core
            .process_encounter_note(
                "patient-1".into(),
                "enc-501".into(),
                "New diagnosis of hypertension".into(),
                "dr-lee".into(),
                FfiTriggerType::RecordingComplete,
            )
            .unwrap();
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].outcome, "created");

        let problems = core.list_problems("patient-1".into(), true).unwrap();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].current_diagnosis_code.as_deref(), Some("I10"));
        assert_eq!(problems[0].visit_history[0].change_kinds, vec!["new_problem"]);

        let report = core.sign_encounter("enc-501".into(), "dr-lee".into()).unwrap();
        assert_eq!(report.entries_signed, 1);

        let audit = core.verify_encounter_signatures("enc-501".into()).unwrap();
        assert_eq!(audit.verified, 1);
        assert!(audit.mismatched.is_empty());

        let visits = core.list_encounter_visits("enc-501".into()).unwrap();
        assert!(visits[0].signed);

        let replay = core
            .process_encounter_note(
                "patient-1".into(),
                "enc-501".into(),
                "New diagnosis of hypertension".into(),
                "dr-lee".into(),
                FfiTriggerType::ManualEdit,
            )
            .unwrap();
        assert!(replay.changes.is_empty());
        assert_eq!(replay.rejected[0].reason_kind, "encounter_signed");
    }

    #[test]
    fn test_error_mapping() {
        let core = core(r#"{"changes": []}"#);
        let err = core
            .process_encounter_note(
                "patient-1".into(),
                "enc-404".into(),
                "note".into(),
                "dr-lee".into(),
                FfiTriggerType::ManualEdit,
            )
            .unwrap_err();
        assert!(matches!(err, ProblemListError::NotFound(_)));

        let err = core.sign_encounter("enc-501".into(), "".into()).unwrap_err();
        assert!(matches!(err, ProblemListError::InvalidInput(_)));

        assert!(core.get_problem("missing".into()).unwrap().is_none());
    }
}
