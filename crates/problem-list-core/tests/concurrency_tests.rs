//! Write conflicts between connections, retries and failed writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::functions::FunctionFlags;
use serde_json::json;
use tempfile::TempDir;

use problem_list_core::db::{Database, DbError};
use problem_list_core::engine::{ChangeOutcome, ConsolidationEngine, ProcessingResult, RejectionReason};
use problem_list_core::models::{EncounterContext, Problem, TriggerType};
use problem_list_core::EngineConfig;
use problem_list_llm::CannedOracle;

fn open_pair() -> (TempDir, Database, Database) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("problems.db");
    let first = Database::open(&path).unwrap();
    let second = Database::open(&path).unwrap();
    (dir, first, second)
}

fn seed(db: &Database) -> Problem {
    for encounter_id in ["enc-1", "enc-2"] {
        db.upsert_encounter(&EncounterContext::new(
            encounter_id.into(),
            "patient-1".into(),
            Some("2024-03-01".into()),
            "dr-lee".into(),
        ))
        .unwrap();
    }
    let mut problem = Problem::new(
        "patient-1".into(),
        "Hypertension".into(),
        "2023-01-10".into(),
        "enc-0".into(),
    );
    problem.current_diagnosis_code = Some("I10".into());
    db.insert_problem(&problem).unwrap();
    problem
}

#[test]
fn test_stale_version_conflicts_across_connections() {
    let (_dir, first, second) = open_pair();
    let problem = seed(&first);

    let mut from_first = first.get_problem(&problem.problem_id).unwrap().unwrap();
    let mut from_second = second.get_problem(&problem.problem_id).unwrap().unwrap();

    from_first.current_diagnosis_code = Some("I11.9".into());
    first.update_problem(&from_first).unwrap();

    from_second.title = "Essential hypertension".into();
    let err = second.update_problem(&from_second).unwrap_err();
    assert!(matches!(err, DbError::Conflict(_)));
    assert!(err.is_retryable());

    let stored = second.get_problem(&problem.problem_id).unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.current_diagnosis_code.as_deref(), Some("I11.9"));
    assert_eq!(stored.title, "Hypertension");
}

#[test]
fn test_encounters_on_separate_connections_both_apply() {
    let (_dir, first, second) = open_pair();
    let problem = seed(&first);
    let config = EngineConfig::default();

    let reply = |notes: &str| {
        json!({"changes": [{"action": "ADD_VISIT", "problem_id": problem.problem_id,
                            "visit_notes": notes, "confidence": 0.9}]})
        .to_string()
    };

    let result = ConsolidationEngine::new(&first, Arc::new(CannedOracle::always(reply("seen in clinic"))), &config)
        .process_encounter_note("patient-1", "enc-1", "note", "dr-lee", TriggerType::RecordingComplete)
        .unwrap();
    assert_eq!(result.changes[0].outcome, ChangeOutcome::EntryAppended);

    let result = ConsolidationEngine::new(&second, Arc::new(CannedOracle::always(reply("phone follow-up"))), &config)
        .process_encounter_note("patient-1", "enc-2", "note", "dr-lee", TriggerType::ManualEdit)
        .unwrap();
    assert_eq!(result.changes[0].outcome, ChangeOutcome::EntryAppended);

    let stored = first.get_problem(&problem.problem_id).unwrap().unwrap();
    assert_eq!(stored.visit_history.len(), 2);
    assert_eq!(stored.version, 2);
    assert_eq!(stored.last_updated_encounter_id, "enc-2");
}

/// Another writer bumps the problem's version right after each of the next
/// `conflicts` visit inserts. Returns how often the race was consulted.
fn race_visit_inserts(db: &Database, conflicts: usize) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    db.conn()
        .create_scalar_function("competing_write", 0, FunctionFlags::SQLITE_UTF8, move |_| {
            Ok(counter.fetch_add(1, Ordering::SeqCst) < conflicts)
        })
        .unwrap();
    db.conn()
        .execute_batch(
            "CREATE TRIGGER competing_writer AFTER INSERT ON visit_history
             WHEN competing_write()
             BEGIN
                 UPDATE problems SET version = version + 1 WHERE problem_id = NEW.problem_id;
             END;",
        )
        .unwrap();
    calls
}

fn seed_gout(db: &Database) -> Problem {
    let mut gout = Problem::new("patient-1".into(), "Gout".into(), "2023-05-02".into(), "enc-0".into());
    gout.current_diagnosis_code = Some("M10.9".into());
    db.insert_problem(&gout).unwrap();
    gout
}

fn add_visits(db: &Database, config: &EngineConfig, problems: &[&Problem]) -> ProcessingResult {
    let changes: Vec<_> = problems
        .iter()
        .map(|p| json!({"action": "ADD_VISIT", "problem_id": p.problem_id, "visit_notes": "seen", "confidence": 0.9}))
        .collect();
    let reply = json!({ "changes": changes }).to_string();
    ConsolidationEngine::new(db, Arc::new(CannedOracle::always(reply)), config)
        .process_encounter_note("patient-1", "enc-1", "note", "dr-lee", TriggerType::RecordingComplete)
        .unwrap()
}

#[test]
fn test_version_conflict_is_retried() {
    let db = Database::open_in_memory().unwrap();
    let htn = seed(&db);
    let calls = race_visit_inserts(&db, 1);

    let result = add_visits(&db, &EngineConfig::default(), &[&htn]);
    assert!(result.rejected.is_empty());
    assert_eq!(result.changes[0].outcome, ChangeOutcome::EntryAppended);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The losing attempt left nothing behind
    let stored = db.get_problem(&htn.problem_id).unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.visit_history.len(), 1);
    assert_eq!(stored.change_log.len(), 1);
}

#[test]
fn test_exhausted_retries_fail_only_that_change() {
    let db = Database::open_in_memory().unwrap();
    let htn = seed(&db);
    let gout = seed_gout(&db);
    race_visit_inserts(&db, 1);
    let no_retries = EngineConfig::new(Duration::from_secs(30), 0, 0.0, 0.93).unwrap();

    let result = add_visits(&db, &no_retries, &[&htn, &gout]);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].index, 0);
    assert!(matches!(
        result.rejected[0].reason,
        RejectionReason::StoreWriteFailure { .. }
    ));
    assert_eq!(result.changes.len(), 1);
    assert_eq!(result.changes[0].problem_id, gout.problem_id);
    assert_eq!(result.problems_affected, 1);

    let stored = db.get_problem(&htn.problem_id).unwrap().unwrap();
    assert_eq!(stored.version, 0);
    assert!(stored.visit_history.is_empty());
    assert!(stored.change_log.is_empty());
}

#[test]
fn test_failed_write_does_not_stop_the_batch() {
    let db = Database::open_in_memory().unwrap();
    let htn = seed(&db);
    let gout = seed_gout(&db);
    db.conn()
        .execute_batch(&format!(
            "CREATE TRIGGER reject_gout_visits BEFORE INSERT ON visit_history
             WHEN NEW.problem_id = '{}'
             BEGIN
                 SELECT RAISE(ABORT, 'disk quota exceeded');
             END;",
            gout.problem_id
        ))
        .unwrap();

    let result = add_visits(&db, &EngineConfig::default(), &[&gout, &htn]);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].index, 0);
    match &result.rejected[0].reason {
        RejectionReason::StoreWriteFailure { detail } => assert!(detail.contains("disk quota exceeded")),
        other => panic!("unexpected rejection: {other:?}"),
    }
    assert_eq!(result.changes.len(), 1);
    assert_eq!(result.changes[0].problem_id, htn.problem_id);

    let stored = db.get_problem(&gout.problem_id).unwrap().unwrap();
    assert_eq!(stored.version, 0);
    assert!(stored.visit_history.is_empty());
    assert_eq!(db.get_problem(&htn.problem_id).unwrap().unwrap().visit_history.len(), 1);
}
