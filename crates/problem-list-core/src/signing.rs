//! Encounter signing.
//!
//! Signing locks every draft visit entry of an encounter and stamps it with a
//! SHA-256 hash of its clinical content, so later tampering is detectable.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{Database, DbError};

/// Signing errors.
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Database error: {0}")]
    Store(#[from] DbError),

    #[error("Hashing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type SigningResult<T> = Result<T, SigningError>;

/// What a signing run locked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SigningReport {
    pub entries_signed: u32,
    /// Problems that had an entry signed, sorted
    pub problems_touched: Vec<String>,
}

/// Result of re-checking the hashes of an encounter's entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureAudit {
    pub verified: u32,
    /// Problems whose signed entry no longer matches its hash
    pub mismatched: Vec<String>,
    pub unsigned: u32,
}

impl SignatureAudit {
    pub fn is_intact(&self) -> bool {
        self.mismatched.is_empty()
    }
}

pub struct SigningService<'a> {
    db: &'a Database,
}

impl<'a> SigningService<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Sign every unsigned entry recorded for `encounter_id`.
    ///
    /// Already-signed entries are left as they are, so signing twice is safe.
    pub fn sign_encounter(
        &self,
        encounter_id: &str,
        clinician_id: &str,
    ) -> SigningResult<SigningReport> {
        if encounter_id.trim().is_empty() || clinician_id.trim().is_empty() {
            return Err(SigningError::InvalidInput(
                "encounter_id and clinician_id are required".into(),
            ));
        }

        let signed_at = chrono::Utc::now().to_rfc3339();
        let tx = self.db.begin()?;

        let mut report = SigningReport::default();
        let mut problems = BTreeSet::new();
        for entry in self.db.visits_for_encounter(encounter_id)? {
            if entry.is_signed() {
                continue;
            }
            let hash = entry.signing_hash(clinician_id, &signed_at)?;
            if self
                .db
                .sign_visit(entry.entry_id, clinician_id, &signed_at, &hash)?
            {
                report.entries_signed += 1;
                problems.insert(entry.problem_id);
            }
        }

        let encounter_marked = self
            .db
            .mark_encounter_signed(encounter_id, clinician_id, &signed_at)?;
        tx.commit().map_err(DbError::from)?;

        report.problems_touched = problems.into_iter().collect();
        info!(
            encounter_id,
            clinician_id,
            entries_signed = report.entries_signed,
            problems = report.problems_touched.len(),
            encounter_marked,
            "signed encounter"
        );
        Ok(report)
    }

    /// Recompute the content hash of every signed entry of `encounter_id`.
    pub fn verify_encounter_signatures(&self, encounter_id: &str) -> SigningResult<SignatureAudit> {
        let mut audit = SignatureAudit::default();

        for entry in self.db.visits_for_encounter(encounter_id)? {
            if !entry.is_signed() {
                audit.unsigned += 1;
            } else if entry.verify_signature()? {
                audit.verified += 1;
            } else {
                warn!(
                    encounter_id,
                    problem_id = %entry.problem_id,
                    entry_id = entry.entry_id,
                    "signed entry does not match its content hash"
                );
                audit.mismatched.push(entry.problem_id);
            }
        }

        Ok(audit)
    }
}
