use crate::db;
use crate::ipc::error::{err, not_found, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    db_conn, now_ts, parse_opt_string, parse_opt_weekday, parse_string_array, parse_weekday,
    required_str, row_exists,
};
use crate::ipc::types::{AppState, Request};
use crate::time::{minutes_to_time, time_to_minutes, TimeRange, MINUTES_PER_DAY};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

/// Editable fields of a stored session, with times already validated.
#[derive(Debug, Clone)]
struct SessionRecord {
    weekday: u8,
    range: TimeRange,
    room: Option<String>,
    note: Option<String>,
    enrollment_ids: Vec<String>,
}

fn session_json(id: &str, rec: &SessionRecord) -> JsonValue {
    json!({
        "id": id,
        "weekday": rec.weekday,
        "startsAt": rec.range.starts_at(),
        "endsAt": rec.range.ends_at(),
        "durationMinutes": rec.range.duration_minutes(),
        "room": rec.room,
        "note": rec.note,
        "enrollmentIds": rec.enrollment_ids
    })
}

fn load_record(conn: &Connection, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
    let row = conn
        .query_row(
            "SELECT weekday, starts_at, ends_at, room, note FROM sessions WHERE id = ?",
            [session_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((weekday, starts_at, ends_at, room, note)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT enrollment_id FROM session_enrollments WHERE session_id = ? ORDER BY position",
    )?;
    let enrollment_ids = stmt
        .query_map([session_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(SessionRecord {
        weekday: u8::try_from(weekday)?,
        range: TimeRange::parse(&starts_at, &ends_at)?,
        room,
        note,
        enrollment_ids,
    }))
}

/// First enrollment id that does not exist, if any.
fn missing_enrollment(conn: &Connection, ids: &[String]) -> rusqlite::Result<Option<String>> {
    for id in ids {
        if !row_exists(conn, "enrollments", id)? {
            return Ok(Some(id.clone()));
        }
    }
    Ok(None)
}

fn write_links(conn: &Connection, session_id: &str, ids: &[String]) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM session_enrollments WHERE session_id = ?",
        [session_id],
    )?;
    for (position, enrollment_id) in ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO session_enrollments(session_id, enrollment_id, position) VALUES(?, ?, ?)",
            params![session_id, enrollment_id, position as i64],
        )?;
    }
    Ok(())
}

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "sessions": [] }));
    };
    let weekday = match parse_opt_weekday(req.params.get("weekday")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("weekday {}", m), None),
    };

    let mut links = match db::session_enrollment_ids(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, weekday, starts_at, ends_at, room, note
         FROM sessions
         WHERE ?1 IS NULL OR weekday = ?1
         ORDER BY weekday, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([weekday.map(i64::from)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let mut rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    // Stored text may be non-canonical (`9:00`) after a raw sqlite import, so
    // order by parsed minute. Unparseable rows go last in their weekday.
    rows.sort_by_key(|(_, weekday, starts_at, ..)| {
        (*weekday, time_to_minutes(starts_at).unwrap_or(u32::MAX))
    });

    let sessions: Vec<JsonValue> = rows
        .into_iter()
        .map(|(id, weekday, starts_at, ends_at, room, note)| {
            let enrollment_ids = links.remove(&id).unwrap_or_default();
            let range = TimeRange::parse(&starts_at, &ends_at).ok();
            json!({
                "id": id,
                "weekday": weekday,
                "startsAt": range.map(|r| r.starts_at()).unwrap_or(starts_at),
                "endsAt": range.map(|r| r.ends_at()).unwrap_or(ends_at),
                "durationMinutes": range.map(|r| r.duration_minutes()),
                "room": room,
                "note": note,
                "enrollmentIds": enrollment_ids
            })
        })
        .collect();

    ok(&req.id, json!({ "sessions": sessions }))
}

fn handle_sessions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(weekday_raw) = req.params.get("weekday") else {
        return err(&req.id, "bad_params", "missing weekday", None);
    };
    let weekday = match parse_weekday(weekday_raw) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("weekday {}", m), None),
    };
    let starts_at = match required_str(req, "startsAt") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match time_to_minutes(&starts_at) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("startsAt: {}", e), None),
    };
    let ends_at = match parse_opt_string(req.params.get("endsAt")) {
        Ok(Some(v)) => v,
        Ok(None) => {
            let default_minutes = match setup::load_general(conn) {
                Ok(g) => g.default_session_minutes,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            minutes_to_time((start + default_minutes).min(MINUTES_PER_DAY))
        }
        Err(m) => return err(&req.id, "bad_params", format!("endsAt {}", m), None),
    };
    let range = match TimeRange::parse(&starts_at, &ends_at) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    let room = match parse_opt_string(req.params.get("room")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("room {}", m), None),
    };
    let note = match parse_opt_string(req.params.get("note")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("note {}", m), None),
    };
    let enrollment_ids = match parse_string_array(req.params.get("enrollmentIds")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("enrollmentIds {}", m), None),
    };
    match missing_enrollment(conn, &enrollment_ids) {
        Ok(None) => {}
        Ok(Some(id)) => {
            return err(
                &req.id,
                "not_found",
                "enrollment not found",
                Some(json!({ "enrollmentId": id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let record = SessionRecord {
        weekday,
        range,
        room,
        note,
        enrollment_ids,
    };
    let session_id = Uuid::new_v4().to_string();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO sessions(id, weekday, starts_at, ends_at, room, note, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![
            session_id,
            i64::from(record.weekday),
            record.range.starts_at(),
            record.range.ends_at(),
            record.room,
            record.note,
            now_ts()
        ],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sessions" })),
        );
    }
    if let Err(e) = write_links(&tx, &session_id, &record.enrollment_ids) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "session_enrollments" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "sessionId": session_id, "session": session_json(&session_id, &record) }),
    )
}

/// Applies a patch over the stored record; times are re-validated together.
fn apply_patch(
    current: &SessionRecord,
    patch: &serde_json::Map<String, JsonValue>,
) -> Result<(SessionRecord, bool), String> {
    let mut next = current.clone();
    let mut links_changed = false;

    if let Some(v) = patch.get("weekday") {
        next.weekday = parse_weekday(v).map_err(|m| format!("patch.weekday {}", m))?;
    }
    let starts_at = match patch.get("startsAt") {
        Some(v) => v
            .as_str()
            .ok_or("patch.startsAt must be a string")?
            .to_string(),
        None => current.range.starts_at(),
    };
    let ends_at = match patch.get("endsAt") {
        Some(v) => v
            .as_str()
            .ok_or("patch.endsAt must be a string")?
            .to_string(),
        None => current.range.ends_at(),
    };
    next.range = TimeRange::parse(&starts_at, &ends_at).map_err(|e| e.to_string())?;

    if patch.contains_key("room") {
        next.room = parse_opt_string(patch.get("room")).map_err(|m| format!("patch.room {}", m))?;
    }
    if patch.contains_key("note") {
        next.note = parse_opt_string(patch.get("note")).map_err(|m| format!("patch.note {}", m))?;
    }
    if patch.contains_key("enrollmentIds") {
        next.enrollment_ids = parse_string_array(patch.get("enrollmentIds"))
            .map_err(|m| format!("patch.enrollmentIds {}", m))?;
        links_changed = true;
    }

    Ok((next, links_changed))
}

fn save_record(
    conn: &Connection,
    req: &Request,
    session_id: &str,
    record: &SessionRecord,
    links_changed: bool,
) -> Result<(), serde_json::Value> {
    if links_changed {
        match missing_enrollment(conn, &record.enrollment_ids) {
            Ok(None) => {}
            Ok(Some(id)) => {
                return Err(err(
                    &req.id,
                    "not_found",
                    "enrollment not found",
                    Some(json!({ "enrollmentId": id })),
                ))
            }
            Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    if let Err(e) = tx.execute(
        "UPDATE sessions
         SET weekday = ?, starts_at = ?, ends_at = ?, room = ?, note = ?, updated_at = ?
         WHERE id = ?",
        params![
            i64::from(record.weekday),
            record.range.starts_at(),
            record.range.ends_at(),
            record.room,
            record.note,
            now_ts(),
            session_id
        ],
    ) {
        let _ = tx.rollback();
        return Err(err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "sessions" })),
        ));
    }
    if links_changed {
        if let Err(e) = write_links(&tx, session_id, &record.enrollment_ids) {
            let _ = tx.rollback();
            return Err(err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "session_enrollments" })),
            ));
        }
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_commit_failed", e.to_string(), None))
}

fn load_existing(
    conn: &Connection,
    req: &Request,
    session_id: &str,
) -> Result<SessionRecord, serde_json::Value> {
    match load_record(conn, session_id) {
        Ok(Some(r)) => Ok(r),
        Ok(None) => Err(not_found(&req.id, "session", session_id)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_sessions_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };
    if let Some(k) = patch
        .keys()
        .find(|k| !matches!(k.as_str(), "weekday" | "startsAt" | "endsAt" | "room" | "note" | "enrollmentIds"))
    {
        return err(&req.id, "bad_params", format!("unknown patch field: {}", k), None);
    }
    if patch.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    let current = match load_existing(conn, req, &session_id) {
        Ok(r) => r,
        Err(e) => return e,
    };
    let (next, links_changed) = match apply_patch(&current, patch) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    if let Err(e) = save_record(conn, req, &session_id, &next, links_changed) {
        return e;
    }

    ok(&req.id, json!({ "session": session_json(&session_id, &next) }))
}

/// Drag-and-drop: new weekday and start time, duration preserved.
fn handle_sessions_move(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current = match load_existing(conn, req, &session_id) {
        Ok(r) => r,
        Err(e) => return e,
    };

    let weekday = match req.params.get("weekday") {
        Some(v) => match parse_weekday(v) {
            Ok(d) => d,
            Err(m) => return err(&req.id, "bad_params", format!("weekday {}", m), None),
        },
        None => current.weekday,
    };
    let starts_at = match required_str(req, "startsAt") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match time_to_minutes(&starts_at) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("startsAt: {}", e), None),
    };
    let end = start + current.range.duration_minutes();
    if end > MINUTES_PER_DAY {
        return err(
            &req.id,
            "bad_params",
            "moved session would end after 24:00",
            Some(json!({ "durationMinutes": current.range.duration_minutes() })),
        );
    }
    let range = match TimeRange::from_minutes(start, end) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };

    let next = SessionRecord {
        weekday,
        range,
        ..current
    };
    if let Err(e) = save_record(conn, req, &session_id, &next, false) {
        return e;
    }

    ok(&req.id, json!({ "session": session_json(&session_id, &next) }))
}

fn handle_sessions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM session_enrollments WHERE session_id = ?",
        [&session_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "session_enrollments" })),
        );
    }
    let removed = match tx.execute("DELETE FROM sessions WHERE id = ?", [&session_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "sessions" })),
            );
        }
    };
    if removed == 0 {
        let _ = tx.rollback();
        return not_found(&req.id, "session", &session_id);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "sessions.create" => Some(handle_sessions_create(state, req)),
        "sessions.update" => Some(handle_sessions_update(state, req)),
        "sessions.move" => Some(handle_sessions_move(state, req)),
        "sessions.delete" => Some(handle_sessions_delete(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord {
            weekday: 1,
            range: TimeRange::parse("09:00", "10:00").unwrap(),
            room: Some("B12".to_string()),
            note: None,
            enrollment_ids: vec!["e1".to_string()],
        }
    }

    fn patch(v: JsonValue) -> serde_json::Map<String, JsonValue> {
        v.as_object().cloned().expect("object")
    }

    #[test]
    fn patch_keeps_untouched_fields() {
        let (next, links_changed) =
            apply_patch(&record(), &patch(json!({ "endsAt": "10:30" }))).expect("patch");
        assert_eq!(next.range, TimeRange::parse("09:00", "10:30").unwrap());
        assert_eq!(next.room.as_deref(), Some("B12"));
        assert_eq!(next.enrollment_ids, vec!["e1".to_string()]);
        assert!(!links_changed);
    }

    #[test]
    fn patch_revalidates_times_against_stored_values() {
        let e = apply_patch(&record(), &patch(json!({ "startsAt": "10:00" }))).unwrap_err();
        assert!(e.contains("must be after"), "{e}");
        assert!(apply_patch(&record(), &patch(json!({ "endsAt": "25:00" }))).is_err());
        assert!(apply_patch(&record(), &patch(json!({ "weekday": 7 }))).is_err());
    }

    #[test]
    fn patch_can_clear_room_and_relink() {
        let (next, links_changed) = apply_patch(
            &record(),
            &patch(json!({ "room": null, "enrollmentIds": ["e2", "e2", "e3"] })),
        )
        .expect("patch");
        assert_eq!(next.room, None);
        assert_eq!(next.enrollment_ids, vec!["e2".to_string(), "e3".to_string()]);
        assert!(links_changed);
    }

    #[test]
    fn list_orders_non_canonical_times_by_minute() {
        let dir = std::env::temp_dir().join(format!(
            "timetable-sessions-list-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let conn = db::open_db(&dir).expect("open_db");
        // Rows as an older tool might have written them.
        conn.execute_batch(
            "INSERT INTO sessions(id, weekday, starts_at, ends_at, created_at)
             VALUES('ten', 1, '10:00', '11:00', 't'),
                   ('nine', 1, '9:00', '9:45', 't'),
                   ('tue', 2, '8:00', '09:00', 't');",
        )
        .expect("seed");

        let mut state = AppState {
            workspace: Some(dir.clone()),
            db: Some(conn),
        };
        let req = Request {
            id: "1".to_string(),
            method: "sessions.list".to_string(),
            params: json!({}),
        };
        let resp = handle_sessions_list(&mut state, &req);
        let sessions = resp["result"]["sessions"].as_array().expect("sessions");
        let ids: Vec<&str> = sessions
            .iter()
            .map(|s| s["id"].as_str().expect("id"))
            .collect();
        assert_eq!(ids, vec!["nine", "ten", "tue"]);
        assert_eq!(sessions[0]["startsAt"], "09:00");
        assert_eq!(sessions[0]["endsAt"], "09:45");
        assert_eq!(sessions[0]["durationMinutes"], 45);

        drop(state);
        let _ = std::fs::remove_dir_all(dir);
    }
}
