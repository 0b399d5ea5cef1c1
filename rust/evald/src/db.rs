use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "evald.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS participant_groups(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            UNIQUE(assessment_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participant_groups_assessment ON participant_groups(assessment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS participants(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT,
            role INTEGER NOT NULL DEFAULT 0,
            group_id TEXT,
            sort_order INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(group_id) REFERENCES participant_groups(id)
        )",
        [],
    )?;
    // Photo references were added after the first roster imports.
    ensure_participants_photo_ref(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participants_assessment ON participants(assessment_id, sort_order)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participants_group ON participants(group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bases(
            id INTEGER NOT NULL,
            assessment_id TEXT NOT NULL,
            name TEXT NOT NULL,
            criterion1 TEXT NOT NULL,
            criterion2 TEXT NOT NULL,
            criterion3 TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(assessment_id, id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_submissions(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            rater_id TEXT NOT NULL,
            participant_id TEXT NOT NULL,
            base_id INTEGER NOT NULL,
            score1 REAL,
            score2 REAL,
            score3 REAL,
            submitted_at TEXT NOT NULL,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(participant_id) REFERENCES participants(id),
            UNIQUE(rater_id, participant_id, base_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_submissions_assessment ON score_submissions(assessment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_score_submissions_participant ON score_submissions(participant_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_participants_photo_ref(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "participants", "photo_ref")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE participants ADD COLUMN photo_ref TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
