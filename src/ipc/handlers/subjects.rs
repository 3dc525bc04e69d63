use crate::ipc::error::{err, not_found, ok};
use crate::ipc::handlers::enrollments::delete_enrollments_for;
use crate::ipc::helpers::{db_conn, ensure_exists, now_ts, parse_opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, params_from_iter, types::Value};
use serde_json::json;
use uuid::Uuid;

/// `#rrggbb`, normalized to lowercase.
fn parse_color(v: Option<&serde_json::Value>) -> Result<Option<String>, &'static str> {
    let Some(s) = parse_opt_string(v)? else {
        return Ok(None);
    };
    let hex = s.strip_prefix('#').ok_or("must look like #rrggbb")?;
    if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err("must look like #rrggbb");
    }
    Ok(Some(format!("#{}", hex.to_ascii_lowercase())))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.color,
           (SELECT COUNT(*) FROM enrollments e WHERE e.subject_id = s.id) AS enrollment_count
         FROM subjects s
         ORDER BY s.name COLLATE NOCASE, s.rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let color: Option<String> = row.get(2)?;
            let enrollment_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "color": color,
                "enrollmentCount": enrollment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let color = match parse_color(req.params.get("color")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("color {}", m), None),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, color, created_at) VALUES(?, ?, ?, ?)",
        params![subject_id, name, color, now_ts()],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "name": name }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("name") {
        let name = v.as_str().map(|s| s.trim().to_string()).unwrap_or_default();
        if name.is_empty() {
            return err(
                &req.id,
                "bad_params",
                "patch.name must be a non-empty string",
                None,
            );
        }
        set_parts.push("name = ?");
        bind_values.push(Value::Text(name));
    }
    if patch.contains_key("color") {
        match parse_color(patch.get("color")) {
            Ok(v) => {
                set_parts.push("color = ?");
                bind_values.push(v.map(Value::Text).unwrap_or(Value::Null));
            }
            Err(m) => return err(&req.id, "bad_params", format!("patch.color {}", m), None),
        }
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    set_parts.push("updated_at = ?");
    bind_values.push(Value::Text(now_ts()));
    let sql = format!("UPDATE subjects SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(subject_id.clone()));

    match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(0) => not_found(&req.id, "subject", &subject_id),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        ),
    }
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "subjects", &subject_id, "subject") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let removed = match delete_enrollments_for(&tx, "subject_id", &subject_id) {
        Ok(n) => n,
        Err((table, e)) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    };

    if let Err(e) = tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "removedEnrollments": removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
