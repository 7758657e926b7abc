//! Executes consolidation decisions against the problem store.
//!
//! Every change runs in its own transaction. A change that hits a version
//! conflict or a busy database is retried from a fresh read, up to
//! `EngineConfig::max_write_retries` times.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, warn};

use super::consolidate::{consolidate, ConsolidationContext, Decision};
use super::{AppliedChange, ChangeOutcome, RejectionReason};
use crate::config::EngineConfig;
use crate::db::{Database, DbError};
use crate::models::{
    ChangeAction, ChangeKind, ChangeLogEntry, ChangeType, Problem, ProblemChange,
    ProblemStatus, VisitHistoryEntry, VisitSource,
};

/// The encounter every change of a batch is recorded against.
#[derive(Debug, Clone, Copy)]
pub struct VisitContext<'a> {
    pub patient_id: &'a str,
    pub encounter_id: &'a str,
    pub encounter_signed: bool,
    /// Normalized `YYYY-MM-DD`
    pub clinical_date: &'a str,
    pub clinician_id: &'a str,
    pub source: VisitSource,
}

enum ApplyError {
    Rejected(RejectionReason),
    Store(DbError),
}

impl From<DbError> for ApplyError {
    fn from(e: DbError) -> Self {
        ApplyError::Store(e)
    }
}

/// Applies the changes of one batch, in order.
pub struct ChangeApplier<'a> {
    db: &'a Database,
    config: &'a EngineConfig,
    visit: VisitContext<'a>,
    /// Problems whose entry for this encounter was written earlier in the batch
    touched: HashSet<String>,
}

impl<'a> ChangeApplier<'a> {
    pub fn new(db: &'a Database, config: &'a EngineConfig, visit: VisitContext<'a>) -> Self {
        Self {
            db,
            config,
            visit,
            touched: HashSet::new(),
        }
    }

    /// Apply one change atomically, or explain why it was not applied.
    pub fn apply(&mut self, change: &ProblemChange) -> Result<AppliedChange, RejectionReason> {
        let started = Instant::now();
        let max_attempts = self.config.max_write_retries().saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.apply_once(change, started) {
                Ok(applied) => {
                    if applied.outcome.wrote_entry() {
                        self.touched.insert(applied.problem_id.clone());
                    }
                    return Ok(applied);
                }
                Err(ApplyError::Rejected(reason)) => return Err(reason),
                Err(ApplyError::Store(e)) if e.is_retryable() && attempt < max_attempts => {
                    debug!(
                        encounter_id = self.visit.encounter_id,
                        attempt,
                        error = %e,
                        "retrying change after write conflict"
                    );
                }
                Err(ApplyError::Store(e)) => {
                    return Err(RejectionReason::StoreWriteFailure {
                        detail: e.to_string(),
                    })
                }
            }
        }
    }

    fn apply_once(
        &self,
        change: &ProblemChange,
        started: Instant,
    ) -> Result<AppliedChange, ApplyError> {
        let tx = self.db.begin()?;

        let problems = self.load_candidates(change)?;
        let ctx = ConsolidationContext {
            encounter_id: self.visit.encounter_id,
            encounter_signed: self.visit.encounter_signed,
            problems: &problems,
            min_confidence: self.config.min_confidence(),
            title_match_threshold: self.config.title_match_threshold(),
        };

        let applied = match consolidate(change, &ctx).map_err(ApplyError::Rejected)? {
            Decision::CreateProblem => self.create_problem(change, started)?,
            Decision::RecordVisit {
                problem,
                existing,
                kind,
            } => self.record_visit(change, problem, existing, kind, started)?,
            Decision::Resolve { problem } => self.resolve(change, problem, started)?,
            Decision::AlreadyResolved { problem } => AppliedChange {
                problem_id: problem.problem_id.clone(),
                action: change.action,
                outcome: ChangeOutcome::Unchanged,
            },
        };

        tx.commit().map_err(DbError::from)?;
        Ok(applied)
    }

    /// Problems of this patient the change may land on.
    fn load_candidates(&self, change: &ProblemChange) -> Result<Vec<Problem>, DbError> {
        if change.action == ChangeAction::NewProblem {
            return self
                .db
                .problems_first_seen_in(self.visit.patient_id, self.visit.encounter_id);
        }

        let Some(target) = change.target_problem_id.as_deref() else {
            return Ok(Vec::new());
        };
        Ok(self
            .db
            .get_problem(target)?
            .filter(|problem| problem.patient_id == self.visit.patient_id)
            .into_iter()
            .collect())
    }

    fn create_problem(
        &self,
        change: &ProblemChange,
        started: Instant,
    ) -> Result<AppliedChange, DbError> {
        let title = change
            .proposed_title
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        let code = change
            .diagnosis_code_change
            .as_ref()
            .map(|code_change| code_change.to.clone());

        let mut problem = Problem::new(
            self.visit.patient_id.to_string(),
            title,
            self.visit.clinical_date.to_string(),
            self.visit.encounter_id.to_string(),
        );
        problem.current_diagnosis_code = code.clone();
        self.db.insert_problem(&problem)?;

        let entry = self.new_entry(&problem.problem_id, change, code.clone(), ChangeKind::NewProblem);
        self.db.insert_visit(&entry)?;

        self.db.append_change_log(&ChangeLogEntry::new(
            problem.problem_id.clone(),
            self.visit.encounter_id.to_string(),
            ChangeType::ProblemCreated,
            None,
            code,
            elapsed_ms(started),
        ))?;

        Ok(AppliedChange {
            problem_id: problem.problem_id,
            action: change.action,
            outcome: ChangeOutcome::Created,
        })
    }

    fn record_visit(
        &self,
        change: &ProblemChange,
        problem: &Problem,
        existing: Option<&VisitHistoryEntry>,
        kind: ChangeKind,
        started: Instant,
    ) -> Result<AppliedChange, DbError> {
        let encounter_id = self.visit.encounter_id;

        // The code this visit carried before the change
        let code_before = match existing {
            Some(current) => current.diagnosis_code_at_visit.clone(),
            None => code_in_effect(problem, encounter_id, self.visit.clinical_date),
        };
        let proposed_code = match kind {
            ChangeKind::VisitAdded => None,
            ChangeKind::NewProblem | ChangeKind::DiagnosisUpdated => {
                change.diagnosis_code_change.as_ref().map(|c| c.to.clone())
            }
        };

        if let Some(stated_from) = change
            .diagnosis_code_change
            .as_ref()
            .filter(|_| kind == ChangeKind::DiagnosisUpdated)
            .and_then(|c| c.from.as_deref())
        {
            if code_before.as_deref() != Some(stated_from) {
                warn!(
                    problem_id = %problem.problem_id,
                    encounter_id,
                    stated_from,
                    actual = ?code_before,
                    "oracle's previous diagnosis code does not match the visit"
                );
            }
        }

        let entry_code = proposed_code.or_else(|| code_before.clone());

        let mut entry = self.new_entry(&problem.problem_id, change, entry_code.clone(), kind);
        let outcome = match existing {
            Some(current) => {
                entry.entry_id = current.entry_id;
                if self.touched.contains(&problem.problem_id) {
                    merge_into(&mut entry, current);
                }
                self.db.replace_visit(&entry)?;
                ChangeOutcome::EntryReplaced
            }
            None => {
                entry.entry_id = self.db.insert_visit(&entry)?;
                ChangeOutcome::EntryAppended
            }
        };

        // The problem follows its chronologically latest entry
        let timeline: Vec<&VisitHistoryEntry> = problem
            .visit_history
            .iter()
            .filter(|e| e.encounter_id != encounter_id)
            .chain(std::iter::once(&entry))
            .collect();
        let latest_code = timeline
            .iter()
            .filter(|e| e.diagnosis_code_at_visit.is_some())
            .max_by(|a, b| chronological(a, b))
            .and_then(|e| e.diagnosis_code_at_visit.clone());
        let is_latest = timeline
            .iter()
            .max_by(|a, b| chronological(a, b))
            .map_or(true, |e| e.encounter_id == encounter_id);

        let mut updated = problem.clone();
        if latest_code.is_some() {
            updated.current_diagnosis_code = latest_code;
        }
        if is_latest {
            updated.last_updated_encounter_id = encounter_id.to_string();
        }
        updated.touch();
        self.db.update_problem(&updated)?;

        let (change_type, previous_code) = if entry_code != code_before {
            (ChangeType::DiagnosisUpdated, code_before)
        } else {
            (ChangeType::VisitAdded, entry_code.clone())
        };
        self.db.append_change_log(&ChangeLogEntry::new(
            problem.problem_id.clone(),
            encounter_id.to_string(),
            change_type,
            previous_code,
            entry_code,
            elapsed_ms(started),
        ))?;

        Ok(AppliedChange {
            problem_id: problem.problem_id.clone(),
            action: change.action,
            outcome,
        })
    }

    fn resolve(
        &self,
        change: &ProblemChange,
        problem: &Problem,
        started: Instant,
    ) -> Result<AppliedChange, DbError> {
        let mut updated = problem.clone();
        updated.status = ProblemStatus::Resolved;
        updated.resolved_encounter_id = Some(self.visit.encounter_id.to_string());
        updated.last_updated_encounter_id = self.visit.encounter_id.to_string();
        updated.touch();
        self.db.update_problem(&updated)?;

        self.db.append_change_log(&ChangeLogEntry::new(
            problem.problem_id.clone(),
            self.visit.encounter_id.to_string(),
            ChangeType::ProblemResolved,
            problem.current_diagnosis_code.clone(),
            problem.current_diagnosis_code.clone(),
            elapsed_ms(started),
        ))?;

        Ok(AppliedChange {
            problem_id: problem.problem_id.clone(),
            action: change.action,
            outcome: ChangeOutcome::Resolved,
        })
    }

    fn new_entry(
        &self,
        problem_id: &str,
        change: &ProblemChange,
        diagnosis_code: Option<String>,
        kind: ChangeKind,
    ) -> VisitHistoryEntry {
        VisitHistoryEntry {
            entry_id: 0,
            problem_id: problem_id.to_string(),
            encounter_id: self.visit.encounter_id.to_string(),
            date: self.visit.clinical_date.to_string(),
            notes: change.visit_notes.clone().unwrap_or_default(),
            source: self.visit.source,
            clinician_id: self.visit.clinician_id.to_string(),
            diagnosis_code_at_visit: diagnosis_code,
            change_kinds: vec![kind],
            confidence: change.confidence,
            signed: false,
            signed_at: None,
            signed_by: None,
            content_hash: None,
            recorded_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Fold an entry written earlier in the same batch into `entry`.
fn merge_into(entry: &mut VisitHistoryEntry, earlier: &VisitHistoryEntry) {
    if entry.notes.trim().is_empty() {
        entry.notes = earlier.notes.clone();
    }
    let kinds = std::mem::replace(&mut entry.change_kinds, earlier.change_kinds.clone());
    for kind in kinds {
        entry.add_change_kind(kind);
    }
}

/// Clinical date first, then write order.
fn chronological(a: &VisitHistoryEntry, b: &VisitHistoryEntry) -> Ordering {
    (a.date.as_str(), a.entry_id).cmp(&(b.date.as_str(), b.entry_id))
}

/// Diagnosis code recorded at the latest other visit on or before `date`.
///
/// Falls back to the problem's current code when no earlier visit carries one.
fn code_in_effect(problem: &Problem, encounter_id: &str, date: &str) -> Option<String> {
    problem
        .visit_history
        .iter()
        .filter(|e| e.encounter_id != encounter_id && e.date.as_str() <= date)
        .filter(|e| e.diagnosis_code_at_visit.is_some())
        .max_by(|a, b| chronological(a, b))
        .and_then(|e| e.diagnosis_code_at_visit.clone())
        .or_else(|| problem.current_diagnosis_code.clone())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiagnosisCodeChange;

    fn visit() -> VisitContext<'static> {
        VisitContext {
            patient_id: "patient-1",
            encounter_id: "enc-501",
            encounter_signed: false,
            clinical_date: "2024-03-01",
            clinician_id: "dr-lee",
            source: VisitSource::Encounter,
        }
    }

    fn seed_problem(db: &Database, title: &str, code: Option<&str>) -> Problem {
        let mut problem = Problem::new(
            "patient-1".into(),
            title.into(),
            "2023-01-10".into(),
            "enc-100".into(),
        );
        problem.current_diagnosis_code = code.map(String::from);
        db.insert_problem(&problem).unwrap();
        problem
    }

    fn add_visit(problem_id: &str, notes: &str) -> ProblemChange {
        ProblemChange {
            target_problem_id: Some(problem_id.into()),
            action: ChangeAction::AddVisit,
            proposed_title: None,
            visit_notes: Some(notes.into()),
            diagnosis_code_change: None,
            confidence: 0.9,
        }
    }

    fn update_icd(problem_id: &str, from: &str, to: &str, notes: &str) -> ProblemChange {
        ProblemChange {
            target_problem_id: Some(problem_id.into()),
            action: ChangeAction::UpdateIcd,
            proposed_title: None,
            visit_notes: Some(notes.into()),
            diagnosis_code_change: Some(DiagnosisCodeChange {
                from: Some(from.into()),
                to: to.into(),
            }),
            confidence: 0.8,
        }
    }

    #[test]
    fn test_new_problem_inserts_problem_entry_and_log() {
        let db = Database::open_in_memory().unwrap();
        let config = EngineConfig::default();
        let mut applier = ChangeApplier::new(&db, &config, visit());

        let change = ProblemChange {
            target_problem_id: None,
            action: ChangeAction::NewProblem,
            proposed_title: Some(" Type 2 diabetes ".into()),
            visit_notes: Some("A1c 8.1".into()),
            diagnosis_code_change: Some(DiagnosisCodeChange {
                from: None,
                to: "E11.9".into(),
            }),
            confidence: 0.95,
        };
        let applied = applier.apply(&change).unwrap();
        assert_eq!(applied.outcome, ChangeOutcome::Created);

        let problem = db.get_problem(&applied.problem_id).unwrap().unwrap();
        assert_eq!(problem.title, "Type 2 diabetes");
        assert_eq!(problem.first_diagnosed_date, "2024-03-01");
        assert_eq!(problem.current_diagnosis_code.as_deref(), Some("E11.9"));
        assert_eq!(problem.visit_history.len(), 1);
        assert_eq!(problem.visit_history[0].date, "2024-03-01");
        assert_eq!(problem.visit_history[0].change_kinds, vec![ChangeKind::NewProblem]);
        assert_eq!(problem.change_log.len(), 1);
        assert_eq!(problem.change_log[0].change_type, ChangeType::ProblemCreated);
    }

    #[test]
    fn test_within_batch_merge() {
        let db = Database::open_in_memory().unwrap();
        let config = EngineConfig::default();
        let htn = seed_problem(&db, "Hypertension", Some("I10"));
        let mut applier = ChangeApplier::new(&db, &config, visit());

        let first = applier.apply(&add_visit(&htn.problem_id, "BP 150/95")).unwrap();
        assert_eq!(first.outcome, ChangeOutcome::EntryAppended);

        let second = applier
            .apply(&update_icd(&htn.problem_id, "I10", "I11.9", ""))
            .unwrap();
        assert_eq!(second.outcome, ChangeOutcome::EntryReplaced);

        let problem = db.get_problem(&htn.problem_id).unwrap().unwrap();
        assert_eq!(problem.visit_history.len(), 1);
        let entry = &problem.visit_history[0];
        assert_eq!(entry.notes, "BP 150/95");
        assert_eq!(
            entry.change_kinds,
            vec![ChangeKind::VisitAdded, ChangeKind::DiagnosisUpdated]
        );
        assert_eq!(entry.diagnosis_code_at_visit.as_deref(), Some("I11.9"));
        assert_eq!(problem.current_diagnosis_code.as_deref(), Some("I11.9"));
    }

    #[test]
    fn test_separate_batches_replace_wholesale() {
        let db = Database::open_in_memory().unwrap();
        let config = EngineConfig::default();
        let htn = seed_problem(&db, "Hypertension", Some("I10"));

        ChangeApplier::new(&db, &config, visit())
            .apply(&update_icd(&htn.problem_id, "I10", "I11.9", "first pass"))
            .unwrap();
        ChangeApplier::new(&db, &config, visit())
            .apply(&add_visit(&htn.problem_id, "corrected"))
            .unwrap();

        let problem = db.get_problem(&htn.problem_id).unwrap().unwrap();
        assert_eq!(problem.visit_history.len(), 1);
        assert_eq!(problem.visit_history[0].notes, "corrected");
        assert_eq!(problem.visit_history[0].change_kinds, vec![ChangeKind::VisitAdded]);
        // ADD_VISIT snapshots the current code
        assert_eq!(
            problem.visit_history[0].diagnosis_code_at_visit.as_deref(),
            Some("I11.9")
        );
    }

    #[test]
    fn test_update_icd_logs_actual_previous_code() {
        let db = Database::open_in_memory().unwrap();
        let config = EngineConfig::default();
        let htn = seed_problem(&db, "Hypertension", Some("I10"));
        let mut applier = ChangeApplier::new(&db, &config, visit());

        applier
            .apply(&update_icd(&htn.problem_id, "I15.0", "I11.9", "LVH on echo"))
            .unwrap();

        let log = db.change_log_for_problem(&htn.problem_id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].change_type, ChangeType::DiagnosisUpdated);
        assert_eq!(log[0].previous_code.as_deref(), Some("I10"));
        assert_eq!(log[0].next_code.as_deref(), Some("I11.9"));
    }

    #[test]
    fn test_resolve_then_noop() {
        let db = Database::open_in_memory().unwrap();
        let config = EngineConfig::default();
        let sprain = seed_problem(&db, "Ankle sprain", Some("S93.401A"));
        let mut applier = ChangeApplier::new(&db, &config, visit());

        let resolve = ProblemChange {
            target_problem_id: Some(sprain.problem_id.clone()),
            action: ChangeAction::Resolve,
            proposed_title: None,
            visit_notes: None,
            diagnosis_code_change: None,
            confidence: 0.9,
        };
        assert_eq!(applier.apply(&resolve).unwrap().outcome, ChangeOutcome::Resolved);
        assert_eq!(applier.apply(&resolve).unwrap().outcome, ChangeOutcome::Unchanged);

        let problem = db.get_problem(&sprain.problem_id).unwrap().unwrap();
        assert_eq!(problem.status, ProblemStatus::Resolved);
        assert_eq!(problem.resolved_encounter_id.as_deref(), Some("enc-501"));
        assert!(problem.visit_history.is_empty());
        assert_eq!(problem.change_log.len(), 1);
        assert_eq!(problem.change_log[0].change_type, ChangeType::ProblemResolved);
    }

    #[test]
    fn test_other_patients_problem_is_unresolved() {
        let db = Database::open_in_memory().unwrap();
        let config = EngineConfig::default();
        let other = Problem::new(
            "patient-2".into(),
            "Asthma".into(),
            "2023-01-10".into(),
            "enc-9".into(),
        );
        db.insert_problem(&other).unwrap();

        let mut applier = ChangeApplier::new(&db, &config, visit());
        let result = applier.apply(&add_visit(&other.problem_id, "wheeze"));
        assert_eq!(
            result,
            Err(RejectionReason::UnresolvedReference {
                problem_id: other.problem_id.clone()
            })
        );
        assert!(db.visits_for_problem(&other.problem_id).unwrap().is_empty());
    }

    #[test]
    fn test_merge_into_keeps_earlier_notes() {
        let earlier = VisitHistoryEntry {
            entry_id: 3,
            problem_id: "p".into(),
            encounter_id: "e".into(),
            date: "2024-03-01".into(),
            notes: "kept".into(),
            source: VisitSource::Encounter,
            clinician_id: "dr".into(),
            diagnosis_code_at_visit: None,
            change_kinds: vec![ChangeKind::NewProblem],
            confidence: 0.9,
            signed: false,
            signed_at: None,
            signed_by: None,
            content_hash: None,
            recorded_at: "t".into(),
        };
        let mut entry = earlier.clone();
        entry.notes = "  ".into();
        entry.change_kinds = vec![ChangeKind::VisitAdded, ChangeKind::NewProblem];

        merge_into(&mut entry, &earlier);
        assert_eq!(entry.notes, "kept");
        assert_eq!(
            entry.change_kinds,
            vec![ChangeKind::NewProblem, ChangeKind::VisitAdded]
        );
    }
}
