//! Problem database operations.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DbError, DbResult};
use crate::models::{Problem, ProblemStatus};

const PROBLEM_COLUMNS: &str = r#"
    problem_id, patient_id, title, current_diagnosis_code, status,
    first_diagnosed_date, first_encounter_id, last_updated_encounter_id,
    resolved_encounter_id, version, created_at, updated_at
"#;

impl Database {
    /// Insert a new problem row. Visit history and change log are written separately.
    pub fn insert_problem(&self, problem: &Problem) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO problems (
                problem_id, patient_id, title, current_diagnosis_code, status,
                first_diagnosed_date, first_encounter_id, last_updated_encounter_id,
                resolved_encounter_id, version, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                problem.problem_id,
                problem.patient_id,
                problem.title,
                problem.current_diagnosis_code,
                problem.status.as_str(),
                problem.first_diagnosed_date,
                problem.first_encounter_id,
                problem.last_updated_encounter_id,
                problem.resolved_encounter_id,
                problem.version,
                problem.created_at,
                problem.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Update a problem row if nobody else has since `problem.version`.
    ///
    /// Returns the new version, or [`DbError::Conflict`] when the row moved on.
    pub fn update_problem(&self, problem: &Problem) -> DbResult<i64> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE problems SET
                title = ?3,
                current_diagnosis_code = ?4,
                status = ?5,
                last_updated_encounter_id = ?6,
                resolved_encounter_id = ?7,
                version = version + 1,
                updated_at = ?8
            WHERE problem_id = ?1 AND version = ?2
            "#,
            params![
                problem.problem_id,
                problem.version,
                problem.title,
                problem.current_diagnosis_code,
                problem.status.as_str(),
                problem.last_updated_encounter_id,
                problem.resolved_encounter_id,
                problem.updated_at,
            ],
        )?;

        if rows_affected == 0 {
            return Err(DbError::Conflict(format!(
                "problem {} changed since version {}",
                problem.problem_id, problem.version
            )));
        }
        Ok(problem.version + 1)
    }

    /// Get a problem with its full visit history and change log.
    pub fn get_problem(&self, problem_id: &str) -> DbResult<Option<Problem>> {
        let sql = format!("SELECT {PROBLEM_COLUMNS} FROM problems WHERE problem_id = ?");
        let row = self
            .conn
            .query_row(&sql, [problem_id], ProblemRow::from_row)
            .optional()?;

        row.map(|row| self.hydrate(row)).transpose()
    }

    /// List all problems of a patient, oldest first.
    pub fn list_problems_for_patient(&self, patient_id: &str) -> DbResult<Vec<Problem>> {
        self.query_problems(
            &format!(
                "SELECT {PROBLEM_COLUMNS} FROM problems WHERE patient_id = ? ORDER BY created_at, rowid"
            ),
            params![patient_id],
        )
    }

    /// List a patient's active problems.
    pub fn list_active_problems(&self, patient_id: &str) -> DbResult<Vec<Problem>> {
        self.query_problems(
            &format!(
                "SELECT {PROBLEM_COLUMNS} FROM problems WHERE patient_id = ? AND status = 'active' ORDER BY created_at, rowid"
            ),
            params![patient_id],
        )
    }

    /// Problems of a patient that were created by `encounter_id`.
    pub fn problems_first_seen_in(
        &self,
        patient_id: &str,
        encounter_id: &str,
    ) -> DbResult<Vec<Problem>> {
        self.query_problems(
            &format!(
                "SELECT {PROBLEM_COLUMNS} FROM problems WHERE patient_id = ? AND first_encounter_id = ? ORDER BY created_at, rowid"
            ),
            params![patient_id, encounter_id],
        )
    }

    fn query_problems(&self, sql: &str, params: impl rusqlite::Params) -> DbResult<Vec<Problem>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, ProblemRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(|row| self.hydrate(row)).collect()
    }

    fn hydrate(&self, row: ProblemRow) -> DbResult<Problem> {
        let visit_history = self.visits_for_problem(&row.problem_id)?;
        let change_log = self.change_log_for_problem(&row.problem_id)?;
        let status = ProblemStatus::from_str(&row.status)
            .ok_or_else(|| DbError::Constraint(format!("Unknown problem status: {}", row.status)))?;

        Ok(Problem {
            problem_id: row.problem_id,
            patient_id: row.patient_id,
            title: row.title,
            current_diagnosis_code: row.current_diagnosis_code,
            status,
            first_diagnosed_date: row.first_diagnosed_date,
            first_encounter_id: row.first_encounter_id,
            last_updated_encounter_id: row.last_updated_encounter_id,
            resolved_encounter_id: row.resolved_encounter_id,
            visit_history,
            change_log,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Intermediate row struct for database mapping.
struct ProblemRow {
    problem_id: String,
    patient_id: String,
    title: String,
    current_diagnosis_code: Option<String>,
    status: String,
    first_diagnosed_date: String,
    first_encounter_id: String,
    last_updated_encounter_id: String,
    resolved_encounter_id: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl ProblemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            problem_id: row.get(0)?,
            patient_id: row.get(1)?,
            title: row.get(2)?,
            current_diagnosis_code: row.get(3)?,
            status: row.get(4)?,
            first_diagnosed_date: row.get(5)?,
            first_encounter_id: row.get(6)?,
            last_updated_encounter_id: row.get(7)?,
            resolved_encounter_id: row.get(8)?,
            version: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}
