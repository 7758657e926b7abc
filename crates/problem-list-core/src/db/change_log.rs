//! Change log database operations.

use rusqlite::params;

use super::{Database, DbError, DbResult};
use crate::models::{ChangeLogEntry, ChangeType};

impl Database {
    /// Append an audit record. Returns the assigned log ID.
    pub fn append_change_log(&self, entry: &ChangeLogEntry) -> DbResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO change_log (
                problem_id, encounter_id, timestamp, change_type,
                previous_code, next_code, processing_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.problem_id,
                entry.encounter_id,
                entry.timestamp,
                entry.change_type.as_str(),
                entry.previous_code,
                entry.next_code,
                i64::try_from(entry.processing_ms).unwrap_or(i64::MAX),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Change log of one problem, oldest first.
    pub fn change_log_for_problem(&self, problem_id: &str) -> DbResult<Vec<ChangeLogEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT log_id, problem_id, encounter_id, timestamp, change_type,
                   previous_code, next_code, processing_ms
            FROM change_log
            WHERE problem_id = ?
            ORDER BY log_id
            "#,
        )?;

        let rows = stmt
            .query_map([problem_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(log_id, problem_id, encounter_id, timestamp, change_type, previous_code, next_code, ms)|
                 -> DbResult<ChangeLogEntry> {
                    let change_type = ChangeType::from_str(&change_type).ok_or_else(|| {
                        DbError::Constraint(format!("Unknown change type: {change_type}"))
                    })?;
                    Ok(ChangeLogEntry {
                        log_id,
                        problem_id,
                        encounter_id,
                        timestamp,
                        change_type,
                        previous_code,
                        next_code,
                        processing_ms: u64::try_from(ms).unwrap_or(0),
                    })
                },
            )
            .collect()
    }
}
