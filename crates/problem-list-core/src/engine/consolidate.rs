//! Matching of validated changes against the patient's problems.
//!
//! Nothing here touches the store: the applier loads the relevant problems,
//! asks [`consolidate`] what to do, and performs the writes.

use strsim::jaro_winkler;

use super::RejectionReason;
use crate::models::{ChangeAction, ChangeKind, Problem, ProblemChange, VisitHistoryEntry};

/// Problems and tunables a change is judged against.
#[derive(Debug, Clone, Copy)]
pub struct ConsolidationContext<'p> {
    pub encounter_id: &'p str,
    /// The encounter has been signed; nothing may be recorded against it
    pub encounter_signed: bool,
    /// The patient's problems relevant to the change
    pub problems: &'p [Problem],
    pub min_confidence: f64,
    pub title_match_threshold: f64,
}

/// What the applier should do with one change.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<'p> {
    /// Insert a new problem with its first entry
    CreateProblem,
    /// Write this encounter's entry on an existing problem
    RecordVisit {
        problem: &'p Problem,
        /// Unsigned entry already recorded for the encounter
        existing: Option<&'p VisitHistoryEntry>,
        kind: ChangeKind,
    },
    Resolve { problem: &'p Problem },
    /// RESOLVE of a problem that is already resolved
    AlreadyResolved { problem: &'p Problem },
}

/// Decide how `change` lands on the problem list.
pub fn consolidate<'p>(
    change: &ProblemChange,
    ctx: &ConsolidationContext<'p>,
) -> Result<Decision<'p>, RejectionReason> {
    if ctx.encounter_signed {
        return Err(RejectionReason::EncounterSigned {
            encounter_id: ctx.encounter_id.to_string(),
        });
    }
    if change.confidence < ctx.min_confidence {
        return Err(RejectionReason::LowConfidence {
            confidence: change.confidence,
            minimum: ctx.min_confidence,
        });
    }

    match change.action {
        ChangeAction::NewProblem => consolidate_new_problem(change, ctx),
        ChangeAction::AddVisit => record_visit(change, ctx, ChangeKind::VisitAdded),
        ChangeAction::UpdateIcd => record_visit(change, ctx, ChangeKind::DiagnosisUpdated),
        ChangeAction::Resolve => {
            let problem = resolve_target(change, ctx)?;
            if problem.is_active() {
                Ok(Decision::Resolve { problem })
            } else {
                Ok(Decision::AlreadyResolved { problem })
            }
        }
    }
}

fn consolidate_new_problem<'p>(
    change: &ProblemChange,
    ctx: &ConsolidationContext<'p>,
) -> Result<Decision<'p>, RejectionReason> {
    let title = change.proposed_title.as_deref().unwrap_or_default();

    let Some(problem) = replayed_problem(title, ctx) else {
        return Ok(Decision::CreateProblem);
    };

    let existing = writable_entry(problem, ctx.encounter_id)?;
    Ok(Decision::RecordVisit {
        problem,
        existing,
        kind: ChangeKind::NewProblem,
    })
}

fn record_visit<'p>(
    change: &ProblemChange,
    ctx: &ConsolidationContext<'p>,
    kind: ChangeKind,
) -> Result<Decision<'p>, RejectionReason> {
    let problem = resolve_target(change, ctx)?;
    if problem.resolved_elsewhere(ctx.encounter_id) {
        return Err(RejectionReason::ProblemResolved {
            problem_id: problem.problem_id.clone(),
        });
    }

    let existing = writable_entry(problem, ctx.encounter_id)?;
    Ok(Decision::RecordVisit {
        problem,
        existing,
        kind,
    })
}

fn resolve_target<'p>(
    change: &ProblemChange,
    ctx: &ConsolidationContext<'p>,
) -> Result<&'p Problem, RejectionReason> {
    let target = change.target_problem_id.as_deref().unwrap_or_default();
    ctx.problems
        .iter()
        .find(|problem| problem.problem_id == target)
        .ok_or_else(|| RejectionReason::UnresolvedReference {
            problem_id: target.to_string(),
        })
}

/// The encounter's entry on `problem`, refusing if it is signed.
fn writable_entry<'p>(
    problem: &'p Problem,
    encounter_id: &str,
) -> Result<Option<&'p VisitHistoryEntry>, RejectionReason> {
    match problem.visit_for_encounter(encounter_id) {
        Some(entry) if entry.is_signed() => Err(RejectionReason::SignedEntryConflict {
            problem_id: problem.problem_id.clone(),
            encounter_id: encounter_id.to_string(),
        }),
        entry => Ok(entry),
    }
}

/// A problem created by this same encounter whose title matches `title`.
fn replayed_problem<'p>(title: &str, ctx: &ConsolidationContext<'p>) -> Option<&'p Problem> {
    let wanted = normalize_title(title);
    if wanted.is_empty() {
        return None;
    }

    ctx.problems
        .iter()
        .filter(|problem| problem.first_encounter_id == ctx.encounter_id)
        .map(|problem| (problem, jaro_winkler(&wanted, &normalize_title(&problem.title))))
        .filter(|(_, score)| *score >= ctx.title_match_threshold)
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(problem, _)| problem)
}

/// Lowercase and collapse whitespace.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
