//! Visit history database operations.

use rusqlite::{params, Row};

use super::{Database, DbError, DbResult};
use crate::models::{ChangeKind, VisitHistoryEntry, VisitSource};

const VISIT_COLUMNS: &str = r#"
    entry_id, problem_id, encounter_id, visit_date, notes, source, clinician_id,
    diagnosis_code, change_kinds, confidence, signed, signed_at, signed_by,
    content_hash, recorded_at
"#;

impl Database {
    /// Append a visit entry. Returns the assigned entry ID.
    pub fn insert_visit(&self, entry: &VisitHistoryEntry) -> DbResult<i64> {
        let change_kinds = serde_json::to_string(&entry.change_kinds)?;

        self.conn.execute(
            r#"
            INSERT INTO visit_history (
                problem_id, encounter_id, visit_date, notes, source, clinician_id,
                diagnosis_code, change_kinds, confidence, signed, signed_at,
                signed_by, content_hash, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                entry.problem_id,
                entry.encounter_id,
                entry.date,
                entry.notes,
                entry.source.as_str(),
                entry.clinician_id,
                entry.diagnosis_code_at_visit,
                change_kinds,
                entry.confidence,
                entry.signed,
                entry.signed_at,
                entry.signed_by,
                entry.content_hash,
                entry.recorded_at,
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Overwrite the content of an unsigned visit entry in place.
    ///
    /// The entry keeps its position in the problem's history.
    pub fn replace_visit(&self, entry: &VisitHistoryEntry) -> DbResult<()> {
        let change_kinds = serde_json::to_string(&entry.change_kinds)?;

        let rows_affected = self.conn.execute(
            r#"
            UPDATE visit_history SET
                visit_date = ?2,
                notes = ?3,
                source = ?4,
                clinician_id = ?5,
                diagnosis_code = ?6,
                change_kinds = ?7,
                confidence = ?8,
                recorded_at = ?9
            WHERE entry_id = ?1 AND signed = 0
            "#,
            params![
                entry.entry_id,
                entry.date,
                entry.notes,
                entry.source.as_str(),
                entry.clinician_id,
                entry.diagnosis_code_at_visit,
                change_kinds,
                entry.confidence,
                entry.recorded_at,
            ],
        )?;

        if rows_affected == 0 {
            return Err(DbError::Constraint(format!(
                "Visit entry {} is signed or missing",
                entry.entry_id
            )));
        }
        Ok(())
    }

    /// Visit history of one problem in recording order.
    pub fn visits_for_problem(&self, problem_id: &str) -> DbResult<Vec<VisitHistoryEntry>> {
        self.query_visits(
            &format!("SELECT {VISIT_COLUMNS} FROM visit_history WHERE problem_id = ? ORDER BY entry_id"),
            params![problem_id],
        )
    }

    /// All visit entries written for an encounter, across problems.
    pub fn visits_for_encounter(&self, encounter_id: &str) -> DbResult<Vec<VisitHistoryEntry>> {
        self.query_visits(
            &format!("SELECT {VISIT_COLUMNS} FROM visit_history WHERE encounter_id = ? ORDER BY entry_id"),
            params![encounter_id],
        )
    }

    /// Visit entries of a patient's problems for one encounter, paired with the problem title.
    pub fn encounter_visits_with_titles(
        &self,
        patient_id: &str,
        encounter_id: &str,
    ) -> DbResult<Vec<(VisitHistoryEntry, String)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT v.entry_id, v.problem_id, v.encounter_id, v.visit_date, v.notes, v.source,
                   v.clinician_id, v.diagnosis_code, v.change_kinds, v.confidence, v.signed,
                   v.signed_at, v.signed_by, v.content_hash, v.recorded_at, p.title
            FROM visit_history v
            JOIN problems p ON p.problem_id = v.problem_id
            WHERE p.patient_id = ?1 AND v.encounter_id = ?2
            ORDER BY v.entry_id
            "#,
        )?;

        let rows = stmt
            .query_map(params![patient_id, encounter_id], |row| {
                Ok((VisitRow::from_row(row)?, row.get::<_, String>(15)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(row, title)| -> DbResult<(VisitHistoryEntry, String)> {
                Ok((VisitHistoryEntry::try_from(row)?, title))
            })
            .collect()
    }

    /// Lock an unsigned entry. Returns false if it was already signed.
    pub fn sign_visit(
        &self,
        entry_id: i64,
        signed_by: &str,
        signed_at: &str,
        content_hash: &str,
    ) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE visit_history SET
                signed = 1,
                signed_by = ?2,
                signed_at = ?3,
                content_hash = ?4
            WHERE entry_id = ?1 AND signed = 0
            "#,
            params![entry_id, signed_by, signed_at, content_hash],
        )?;
        Ok(rows_affected > 0)
    }

    fn query_visits(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> DbResult<Vec<VisitHistoryEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, VisitRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(VisitHistoryEntry::try_from).collect()
    }
}

/// Intermediate row struct for database mapping.
struct VisitRow {
    entry_id: i64,
    problem_id: String,
    encounter_id: String,
    visit_date: String,
    notes: String,
    source: String,
    clinician_id: String,
    diagnosis_code: Option<String>,
    change_kinds: String,
    confidence: f64,
    signed: bool,
    signed_at: Option<String>,
    signed_by: Option<String>,
    content_hash: Option<String>,
    recorded_at: String,
}

impl VisitRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entry_id: row.get(0)?,
            problem_id: row.get(1)?,
            encounter_id: row.get(2)?,
            visit_date: row.get(3)?,
            notes: row.get(4)?,
            source: row.get(5)?,
            clinician_id: row.get(6)?,
            diagnosis_code: row.get(7)?,
            change_kinds: row.get(8)?,
            confidence: row.get(9)?,
            signed: row.get(10)?,
            signed_at: row.get(11)?,
            signed_by: row.get(12)?,
            content_hash: row.get(13)?,
            recorded_at: row.get(14)?,
        })
    }
}

impl TryFrom<VisitRow> for VisitHistoryEntry {
    type Error = DbError;

    fn try_from(row: VisitRow) -> Result<Self, Self::Error> {
        let source = VisitSource::from_str(&row.source)
            .ok_or_else(|| DbError::Constraint(format!("Unknown visit source: {}", row.source)))?;
        let change_kinds: Vec<ChangeKind> = serde_json::from_str(&row.change_kinds)?;

        Ok(VisitHistoryEntry {
            entry_id: row.entry_id,
            problem_id: row.problem_id,
            encounter_id: row.encounter_id,
            date: row.visit_date,
            notes: row.notes,
            source,
            clinician_id: row.clinician_id,
            diagnosis_code_at_visit: row.diagnosis_code,
            change_kinds,
            confidence: row.confidence,
            signed: row.signed,
            signed_at: row.signed_at,
            signed_by: row.signed_by,
            content_hash: row.content_hash,
            recorded_at: row.recorded_at,
        })
    }
}
