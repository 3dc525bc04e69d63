use crate::ipc::error::{err, not_found};
use crate::ipc::types::{AppState, Request};
use crate::layout::WEEKDAYS;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value as JsonValue;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, JsonValue> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, JsonValue> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Absent or null is `None`; blank strings collapse to `None` too.
pub fn parse_opt_string(v: Option<&JsonValue>) -> Result<Option<String>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v.as_str().ok_or("must be a string or null")?.trim();
            Ok(if s.is_empty() { None } else { Some(s.to_string()) })
        }
    }
}

pub fn parse_weekday(v: &JsonValue) -> Result<u8, &'static str> {
    v.as_u64()
        .and_then(|d| u8::try_from(d).ok())
        .filter(|d| *d < WEEKDAYS)
        .ok_or("must be an integer in 0..=6")
}

pub fn parse_opt_weekday(v: Option<&JsonValue>) -> Result<Option<u8>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => parse_weekday(v).map(Some),
    }
}

pub fn parse_string_array(v: Option<&JsonValue>) -> Result<Vec<String>, &'static str> {
    let Some(v) = v else {
        return Ok(Vec::new());
    };
    if v.is_null() {
        return Ok(Vec::new());
    }
    let arr = v.as_array().ok_or("must be an array of strings")?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item.as_str().ok_or("must be an array of strings")?.trim();
        if !s.is_empty() && !out.iter().any(|x: &String| x == s) {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

/// `Ok(true)` if a row with this id exists in `table`.
pub fn row_exists(conn: &Connection, table: &str, id: &str) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ? LIMIT 1", table);
    conn.query_row(&sql, [id], |_r| Ok(()))
        .optional()
        .map(|v| v.is_some())
}

/// Maps a missing row to `not_found` and a query failure to `db_query_failed`.
pub fn ensure_exists(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), JsonValue> {
    match row_exists(conn, table, id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(not_found(&req.id, what, id)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}
