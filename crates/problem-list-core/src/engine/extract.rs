//! Oracle request assembly and the time-bounded oracle call.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use problem_list_llm::{
    EncounterMeta, EncounterVisit, ExtractionError, ExtractionOracle, ExtractionResult,
    OracleRequest, ProblemSummary,
};

use crate::models::{EncounterContext, Problem, TriggerType, VisitHistoryEntry};

/// Assemble what the oracle sees for one note.
pub fn build_request(
    encounter: &EncounterContext,
    clinical_date: &str,
    problems: &[Problem],
    encounter_visits: &[(VisitHistoryEntry, String)],
    note_text: &str,
    trigger: TriggerType,
) -> OracleRequest {
    OracleRequest {
        current_problems: problems
            .iter()
            .map(|problem| ProblemSummary {
                id: problem.problem_id.clone(),
                title: problem.title.clone(),
                diagnosis_code: problem.current_diagnosis_code.clone(),
                status: problem.status.as_str().to_string(),
            })
            .collect(),
        encounter_visits: encounter_visits
            .iter()
            .map(|(entry, title)| EncounterVisit {
                problem_id: entry.problem_id.clone(),
                problem_title: title.clone(),
                visit_date: entry.date.clone(),
                notes: entry.notes.clone(),
            })
            .collect(),
        note_text: note_text.to_string(),
        encounter: EncounterMeta {
            date: clinical_date.to_string(),
            patient_age: encounter.patient_age_years,
            trigger_type: trigger,
        },
    }
}

/// Call the oracle on a worker thread and wait at most `timeout`.
///
/// On timeout the worker is left to finish on its own; its reply is discarded.
pub fn call_oracle(
    oracle: Arc<dyn ExtractionOracle>,
    request: &OracleRequest,
    timeout: Duration,
) -> ExtractionResult<String> {
    let (tx, rx) = mpsc::channel();
    let request = request.clone();

    thread::Builder::new()
        .name("problem-list-oracle".into())
        .spawn(move || {
            // Receiver is gone after a timeout
            let _ = tx.send(oracle.extract_changes(&request));
        })
        .map_err(|e| ExtractionError::Inference(format!("failed to spawn oracle worker: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(reply) => reply,
        Err(RecvTimeoutError::Timeout) => Err(ExtractionError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(ExtractionError::Inference(
            "oracle worker exited without replying".into(),
        )),
    }
}
