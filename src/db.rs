use crate::layout::Session;
use crate::time::TimeRange;
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

pub const DB_FILE_NAME: &str = "timetable.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            color TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_subject ON enrollments(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            weekday INTEGER NOT NULL,
            starts_at TEXT NOT NULL,
            ends_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    // Older workspaces predate room/note on sessions.
    ensure_sessions_room_and_note(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_weekday ON sessions(weekday)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_enrollments(
            session_id TEXT NOT NULL,
            enrollment_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY(session_id, enrollment_id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_enrollments_enrollment ON session_enrollments(enrollment_id)",
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

fn ensure_sessions_room_and_note(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "sessions", "room")? {
        conn.execute("ALTER TABLE sessions ADD COLUMN room TEXT", [])?;
    }
    if !table_has_column(conn, "sessions", "note")? {
        conn.execute("ALTER TABLE sessions ADD COLUMN note TEXT", [])?;
    }
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
        Some(text) => {
            let value = serde_json::from_str(&text)
                .with_context(|| format!("settings value for {} is not valid JSON", key))?;
            Ok(Some(value))
        }
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

/// Enrollment ids linked to each session, in link order.
pub fn session_enrollment_ids(conn: &Connection) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, enrollment_id
         FROM session_enrollments
         ORDER BY session_id, position",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (session_id, enrollment_id) in rows {
        out.entry(session_id).or_default().push(enrollment_id);
    }
    Ok(out)
}

/// Sessions as layout input, optionally for a single weekday.
///
/// Rows come back in insertion (rowid) order so sessions sharing a start time
/// keep a stable relative order between reloads, whatever the wall clock did.
pub fn load_sessions(conn: &Connection, weekday: Option<u8>) -> anyhow::Result<Vec<Session>> {
    let mut links = session_enrollment_ids(conn)?;
    let mut stmt = conn.prepare(
        "SELECT id, weekday, starts_at, ends_at
         FROM sessions
         WHERE ?1 IS NULL OR weekday = ?1
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([weekday.map(i64::from)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut sessions = Vec::with_capacity(rows.len());
    for (id, weekday, starts_at, ends_at) in rows {
        let weekday = u8::try_from(weekday)
            .ok()
            .filter(|d| *d < crate::layout::WEEKDAYS)
            .with_context(|| format!("session {} has invalid weekday {}", id, weekday))?;
        let range = TimeRange::parse(&starts_at, &ends_at)
            .with_context(|| format!("session {} has invalid times", id))?;
        let mut session = Session::new(id, weekday, range);
        session.enrollment_ids = links.remove(&session.id).unwrap_or_default();
        sessions.push(session);
    }
    Ok(sessions)
}
