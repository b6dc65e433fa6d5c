use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("warning-tracker.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_name)",
        [],
    )?;

    // Warning records are never physically deleted; they carry the full
    // resolution trail for undo and the "resolved today" counter.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS warning_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            details TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            resolved_by TEXT,
            resolution_note TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_warning_records_student ON warning_records(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_warning_records_status ON warning_records(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS warning_audit(
            id TEXT PRIMARY KEY,
            warning_id TEXT NOT NULL,
            actor TEXT NOT NULL,
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            note TEXT,
            at TEXT NOT NULL,
            FOREIGN KEY(warning_id) REFERENCES warning_records(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_warning_audit_warning ON warning_audit(warning_id)",
        [],
    )?;

    // Soft-deleted entries stay in the table with is_active=0 so history and
    // re-add scenarios keep working.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS priority_entries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            source_type TEXT NOT NULL,
            priority_level TEXT NOT NULL,
            category TEXT,
            custom_tags TEXT NOT NULL,
            intervention_goals TEXT NOT NULL,
            notes TEXT,
            reason_description TEXT NOT NULL,
            follow_up_end_date TEXT,
            created_at TEXT NOT NULL,
            is_active INTEGER NOT NULL,
            removed_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_priority_entries_student ON priority_entries(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_priority_entries_active ON priority_entries(is_active)",
        [],
    )?;

    // Published output of the external scoring provider, one row per student.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS risk_scores(
            student_id TEXT PRIMARY KEY,
            score REAL NOT NULL,
            factors TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_participation(
            student_id TEXT NOT NULL,
            exam_title TEXT NOT NULL,
            PRIMARY KEY(student_id, exam_title),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_participation_title ON exam_participation(exam_title)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS interventions(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            intervention_type TEXT NOT NULL,
            description TEXT NOT NULL,
            result TEXT,
            follow_up_required INTEGER NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_interventions_student ON interventions(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tracking_notes(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            note_type TEXT NOT NULL,
            content TEXT NOT NULL,
            is_private INTEGER NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tracking_notes_student ON tracking_notes(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tracker_settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}
