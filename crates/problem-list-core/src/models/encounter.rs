//! Encounter context models.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

pub use problem_list_llm::TriggerType;

/// Read-only facts about the visit being processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncounterContext {
    pub encounter_id: String,
    pub patient_id: String,
    /// Clinical date of the visit; required for processing
    pub clinical_date: Option<String>,
    /// Attending clinician
    pub clinician_id: String,
    pub patient_age_years: Option<u32>,
    pub signed: bool,
    pub signed_at: Option<String>,
    pub signed_by: Option<String>,
}

impl EncounterContext {
    /// Create an unsigned encounter.
    pub fn new(
        encounter_id: String,
        patient_id: String,
        clinical_date: Option<String>,
        clinician_id: String,
    ) -> Self {
        Self {
            encounter_id,
            patient_id,
            clinical_date,
            clinician_id,
            patient_age_years: None,
            signed: false,
            signed_at: None,
            signed_by: None,
        }
    }

    /// The clinical date as `YYYY-MM-DD`, if present and parseable.
    pub fn normalized_clinical_date(&self) -> Option<String> {
        self.clinical_date.as_deref().and_then(normalize_clinical_date)
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp and returns the calendar date.
pub fn normalize_clinical_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))?;
    Some(date.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_clinical_date() {
        assert_eq!(normalize_clinical_date("2024-03-01"), Some("2024-03-01".into()));
        assert_eq!(
            normalize_clinical_date("2024-03-01T14:30:00-05:00"),
            Some("2024-03-01".into())
        );
        assert_eq!(normalize_clinical_date(""), None);
        assert_eq!(normalize_clinical_date("03/01/2024"), None);
    }

    #[test]
    fn test_missing_date() {
        let ctx = EncounterContext::new("enc-1".into(), "patient-1".into(), None, "dr-lee".into());
        assert_eq!(ctx.normalized_clinical_date(), None);
        assert!(!ctx.signed);
    }
}
