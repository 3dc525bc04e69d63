use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, ensure_exists, now_ts, parse_opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Removes every enrollment whose `column` equals `id`, unlinking them from
/// sessions first. `column` is `student_id` or `subject_id`.
///
/// On failure returns the table that could not be cleared.
pub fn delete_enrollments_for(
    conn: &Connection,
    column: &str,
    id: &str,
) -> Result<usize, (&'static str, rusqlite::Error)> {
    debug_assert!(matches!(column, "student_id" | "subject_id"));

    conn.execute(
        &format!(
            "DELETE FROM session_enrollments
             WHERE enrollment_id IN (SELECT id FROM enrollments WHERE {} = ?)",
            column
        ),
        [id],
    )
    .map_err(|e| ("session_enrollments", e))?;

    conn.execute(
        &format!("DELETE FROM enrollments WHERE {} = ?", column),
        [id],
    )
    .map_err(|e| ("enrollments", e))
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "enrollments": [] }));
    };
    let student_id = match parse_opt_string(req.params.get("studentId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentId {}", m), None),
    };
    let subject_id = match parse_opt_string(req.params.get("subjectId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("subjectId {}", m), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           e.id,
           e.student_id,
           st.name,
           e.subject_id,
           su.name,
           su.color,
           (SELECT COUNT(*) FROM session_enrollments se WHERE se.enrollment_id = e.id) AS session_count
         FROM enrollments e
         JOIN students st ON st.id = e.student_id
         JOIN subjects su ON su.id = e.subject_id
         WHERE (?1 IS NULL OR e.student_id = ?1)
           AND (?2 IS NULL OR e.subject_id = ?2)
         ORDER BY st.name COLLATE NOCASE, su.name COLLATE NOCASE, e.rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(params![student_id, subject_id], |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let student_name: String = row.get(2)?;
            let subject_id: String = row.get(3)?;
            let subject_name: String = row.get(4)?;
            let subject_color: Option<String> = row.get(5)?;
            let session_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "studentName": student_name,
                "subjectId": subject_id,
                "subjectName": subject_name,
                "subjectColor": subject_color,
                "sessionCount": session_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "students", &student_id, "student") {
        return e;
    }
    if let Err(e) = ensure_exists(conn, req, "subjects", &subject_id, "subject") {
        return e;
    }

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM enrollments WHERE student_id = ? AND subject_id = ?",
            [&student_id, &subject_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(enrollment_id) = existing {
        return err(
            &req.id,
            "conflict",
            "student is already enrolled in this subject",
            Some(json!({ "enrollmentId": enrollment_id })),
        );
    }

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, student_id, subject_id, created_at) VALUES(?, ?, ?, ?)",
        params![enrollment_id, student_id, subject_id, now_ts()],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    ok(&req.id, json!({ "enrollmentId": enrollment_id }))
}

fn handle_enrollments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "enrollments", &enrollment_id, "enrollment") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let unlinked = match tx.execute(
        "DELETE FROM session_enrollments WHERE enrollment_id = ?",
        [&enrollment_id],
    ) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "session_enrollments" })),
            );
        }
    };

    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE id = ?", [&enrollment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "unlinkedSessions": unlinked }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.delete" => Some(handle_enrollments_delete(state, req)),
        _ => None,
    }
}
