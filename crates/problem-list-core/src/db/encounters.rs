//! Encounter database operations.

use rusqlite::{params, OptionalExtension};

use super::{Database, DbResult};
use crate::models::EncounterContext;

/// Read-only lookup of the encounter being processed.
pub trait EncounterContextProvider {
    fn encounter_context(&self, encounter_id: &str) -> DbResult<Option<EncounterContext>>;
}

impl Database {
    /// Insert or update an encounter. Signing state is left untouched on update.
    pub fn upsert_encounter(&self, encounter: &EncounterContext) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO encounters (
                encounter_id, patient_id, clinical_date, clinician_id,
                patient_age_years, signed, signed_at, signed_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(encounter_id) DO UPDATE SET
                patient_id = excluded.patient_id,
                clinical_date = excluded.clinical_date,
                clinician_id = excluded.clinician_id,
                patient_age_years = excluded.patient_age_years,
                updated_at = datetime('now')
            "#,
            params![
                encounter.encounter_id,
                encounter.patient_id,
                encounter.clinical_date,
                encounter.clinician_id,
                encounter.patient_age_years,
                encounter.signed,
                encounter.signed_at,
                encounter.signed_by,
            ],
        )?;
        Ok(())
    }

    /// Get an encounter by ID.
    pub fn get_encounter(&self, encounter_id: &str) -> DbResult<Option<EncounterContext>> {
        self.conn
            .query_row(
                r#"
                SELECT encounter_id, patient_id, clinical_date, clinician_id,
                       patient_age_years, signed, signed_at, signed_by
                FROM encounters
                WHERE encounter_id = ?
                "#,
                [encounter_id],
                |row| {
                    Ok(EncounterContext {
                        encounter_id: row.get(0)?,
                        patient_id: row.get(1)?,
                        clinical_date: row.get(2)?,
                        clinician_id: row.get(3)?,
                        patient_age_years: row.get(4)?,
                        signed: row.get(5)?,
                        signed_at: row.get(6)?,
                        signed_by: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Mark an encounter signed. Returns false if unknown or already signed.
    pub fn mark_encounter_signed(
        &self,
        encounter_id: &str,
        signed_by: &str,
        signed_at: &str,
    ) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE encounters SET
                signed = 1,
                signed_at = ?2,
                signed_by = ?3,
                updated_at = datetime('now')
            WHERE encounter_id = ?1 AND signed = 0
            "#,
            params![encounter_id, signed_at, signed_by],
        )?;
        Ok(rows_affected > 0)
    }
}

impl EncounterContextProvider for Database {
    fn encounter_context(&self, encounter_id: &str) -> DbResult<Option<EncounterContext>> {
        self.get_encounter(encounter_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_get() {
        let db = Database::open_in_memory().unwrap();

        let mut encounter = EncounterContext::new(
            "enc-501".into(),
            "patient-1".into(),
            Some("2024-03-01".into()),
            "dr-lee".into(),
        );
        encounter.patient_age_years = Some(64);
        db.upsert_encounter(&encounter).unwrap();

        let retrieved = db.get_encounter("enc-501").unwrap().unwrap();
        assert_eq!(retrieved, encounter);

        encounter.clinical_date = Some("2024-03-02".into());
        db.upsert_encounter(&encounter).unwrap();
        let retrieved = db.encounter_context("enc-501").unwrap().unwrap();
        assert_eq!(retrieved.clinical_date.as_deref(), Some("2024-03-02"));
    }

    #[test]
    fn test_unknown_encounter() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_encounter("missing").unwrap().is_none());
        assert!(!db.mark_encounter_signed("missing", "dr", "t").unwrap());
    }

    #[test]
    fn test_mark_signed_once() {
        let db = Database::open_in_memory().unwrap();
        let encounter = EncounterContext::new(
            "enc-1".into(),
            "patient-1".into(),
            Some("2024-03-01".into()),
            "dr-lee".into(),
        );
        db.upsert_encounter(&encounter).unwrap();

        assert!(db.mark_encounter_signed("enc-1", "dr-lee", "t1").unwrap());
        assert!(!db.mark_encounter_signed("enc-1", "dr-kim", "t2").unwrap());

        // Re-registering does not unsign
        db.upsert_encounter(&encounter).unwrap();
        let retrieved = db.get_encounter("enc-1").unwrap().unwrap();
        assert!(retrieved.signed);
        assert_eq!(retrieved.signed_by.as_deref(), Some("dr-lee"));
    }
}
