//! Problem models.

use serde::{Deserialize, Serialize};

use super::change_log::ChangeLogEntry;
use super::visit::VisitHistoryEntry;

/// Problem status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProblemStatus {
    Active,
    Resolved,
}

impl ProblemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemStatus::Active => "active",
            ProblemStatus::Resolved => "resolved",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProblemStatus::Active),
            "resolved" => Some(ProblemStatus::Resolved),
            _ => None,
        }
    }
}

/// One longitudinal clinical issue for a patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Problem {
    /// Stable problem ID
    pub problem_id: String,
    pub patient_id: String,
    pub title: String,
    /// Coded classifier (ICD-10-like), if known
    pub current_diagnosis_code: Option<String>,
    pub status: ProblemStatus,
    /// Clinical date of the encounter that created the problem
    pub first_diagnosed_date: String,
    pub first_encounter_id: String,
    pub last_updated_encounter_id: String,
    /// Encounter that resolved the problem
    pub resolved_encounter_id: Option<String>,
    /// Clinical narrative, one entry per encounter, in recording order
    pub visit_history: Vec<VisitHistoryEntry>,
    /// Audit trail of mutations, oldest first
    pub change_log: Vec<ChangeLogEntry>,
    /// Optimistic concurrency version, bumped on every row update
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Problem {
    /// Create a new active problem first seen in `encounter_id`.
    pub fn new(
        patient_id: String,
        title: String,
        first_diagnosed_date: String,
        encounter_id: String,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            problem_id: uuid::Uuid::new_v4().to_string(),
            patient_id,
            title,
            current_diagnosis_code: None,
            status: ProblemStatus::Active,
            first_diagnosed_date,
            first_encounter_id: encounter_id.clone(),
            last_updated_encounter_id: encounter_id,
            resolved_encounter_id: None,
            visit_history: Vec::new(),
            change_log: Vec::new(),
            version: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ProblemStatus::Active
    }

    /// The visit entry recorded for `encounter_id`, if any.
    pub fn visit_for_encounter(&self, encounter_id: &str) -> Option<&VisitHistoryEntry> {
        self.visit_history
            .iter()
            .find(|entry| entry.encounter_id == encounter_id)
    }

    /// Whether a resolved problem was resolved by some other encounter.
    pub fn resolved_elsewhere(&self, encounter_id: &str) -> bool {
        self.status == ProblemStatus::Resolved
            && self.resolved_encounter_id.as_deref() != Some(encounter_id)
    }

    /// Touch the updated_at timestamp.
    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_problem() {
        let problem = Problem::new(
            "patient-1".into(),
            "Hypertension".into(),
            "2024-03-01".into(),
            "enc-501".into(),
        );
        assert!(problem.is_active());
        assert_eq!(problem.problem_id.len(), 36);
        assert_eq!(problem.first_encounter_id, "enc-501");
        assert_eq!(problem.last_updated_encounter_id, "enc-501");
        assert!(problem.visit_history.is_empty());
    }

    #[test]
    fn test_resolved_elsewhere() {
        let mut problem = Problem::new(
            "patient-1".into(),
            "Ankle sprain".into(),
            "2024-03-01".into(),
            "enc-1".into(),
        );
        assert!(!problem.resolved_elsewhere("enc-2"));

        problem.status = ProblemStatus::Resolved;
        problem.resolved_encounter_id = Some("enc-2".into());
        assert!(!problem.resolved_elsewhere("enc-2"));
        assert!(problem.resolved_elsewhere("enc-3"));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [ProblemStatus::Active, ProblemStatus::Resolved] {
            assert_eq!(ProblemStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ProblemStatus::from_str("deleted"), None);
    }
}
