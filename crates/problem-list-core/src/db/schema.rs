//! SQLite schema definition.

/// Complete database schema for the problem list.
pub const SCHEMA: &str = r#"
-- Enable foreign keys
PRAGMA foreign_keys = ON;

-- ============================================================================
-- Encounters (context provider)
-- ============================================================================

CREATE TABLE IF NOT EXISTS encounters (
    encounter_id TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL,
    clinical_date TEXT,                           -- YYYY-MM-DD; NULL is an input error at processing time
    clinician_id TEXT NOT NULL,
    patient_age_years INTEGER,
    signed INTEGER NOT NULL DEFAULT 0,
    signed_at TEXT,
    signed_by TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_encounters_patient ON encounters(patient_id);

-- ============================================================================
-- Problems
-- ============================================================================

CREATE TABLE IF NOT EXISTS problems (
    problem_id TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL,
    title TEXT NOT NULL,
    current_diagnosis_code TEXT,
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'resolved')),
    first_diagnosed_date TEXT NOT NULL,
    first_encounter_id TEXT NOT NULL,
    last_updated_encounter_id TEXT NOT NULL,
    resolved_encounter_id TEXT,
    version INTEGER NOT NULL DEFAULT 0,           -- optimistic concurrency
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_problems_patient ON problems(patient_id, status);
CREATE INDEX IF NOT EXISTS idx_problems_first_encounter ON problems(patient_id, first_encounter_id);

-- Problems are never physically deleted
CREATE TRIGGER IF NOT EXISTS problems_no_delete BEFORE DELETE ON problems
BEGIN
    SELECT RAISE(ABORT, 'Problems cannot be deleted');
END;

-- ============================================================================
-- Visit History (one entry per problem per encounter)
-- ============================================================================

CREATE TABLE IF NOT EXISTS visit_history (
    entry_id INTEGER PRIMARY KEY AUTOINCREMENT,   -- position in the problem's history
    problem_id TEXT NOT NULL REFERENCES problems(problem_id),
    encounter_id TEXT NOT NULL,
    visit_date TEXT NOT NULL,
    notes TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL CHECK (source IN ('encounter', 'manual', 'imported')),
    clinician_id TEXT NOT NULL,
    diagnosis_code TEXT,
    change_kinds TEXT NOT NULL DEFAULT '[]',      -- JSON array of ChangeKind
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    signed INTEGER NOT NULL DEFAULT 0,
    signed_at TEXT,
    signed_by TEXT,
    content_hash TEXT,
    recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (problem_id, encounter_id)
);

CREATE INDEX IF NOT EXISTS idx_visits_encounter ON visit_history(encounter_id);

-- Signed entries are immutable
CREATE TRIGGER IF NOT EXISTS visit_history_signed_immutable BEFORE UPDATE ON visit_history
WHEN old.signed = 1
BEGIN
    SELECT RAISE(ABORT, 'Signed visit entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS visit_history_no_delete BEFORE DELETE ON visit_history
BEGIN
    SELECT RAISE(ABORT, 'Visit entries cannot be deleted');
END;

-- ============================================================================
-- Change Log (Append-Only)
-- ============================================================================

CREATE TABLE IF NOT EXISTS change_log (
    log_id INTEGER PRIMARY KEY AUTOINCREMENT,
    problem_id TEXT NOT NULL REFERENCES problems(problem_id),
    encounter_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    change_type TEXT NOT NULL CHECK (change_type IN
        ('visit_added', 'diagnosis_updated', 'problem_created', 'problem_resolved')),
    previous_code TEXT,
    next_code TEXT,
    processing_ms INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_change_log_problem ON change_log(problem_id);

CREATE TRIGGER IF NOT EXISTS change_log_no_update BEFORE UPDATE ON change_log
BEGIN
    SELECT RAISE(ABORT, 'Change log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS change_log_no_delete BEFORE DELETE ON change_log
BEGIN
    SELECT RAISE(ABORT, 'Change log is append-only');
END;
"#;
