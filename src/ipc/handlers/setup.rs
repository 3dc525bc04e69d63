use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::layout::{LayoutConfig, WEEKDAYS};
use crate::time::{minutes_to_time, time_to_minutes};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Timetable,
    General,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "timetable" => Some(Self::Timetable),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Timetable => "setup.timetable",
            Self::General => "setup.general",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralSettings {
    pub school_name: String,
    pub week_starts_on: u8,
    pub default_session_minutes: u32,
    pub visible_weekdays: Vec<u8>,
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Timetable => {
            serde_json::to_value(LayoutConfig::default()).unwrap_or_else(|_| json!({}))
        }
        SetupSection::General => json!({
            "schoolName": "",
            "weekStartsOn": 1,
            "defaultSessionMinutes": 60,
            "visibleWeekdays": [1, 2, 3, 4, 5]
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

/// Canonical `HH:MM`.
fn parse_clock(v: &Value, key: &str) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let minutes = time_to_minutes(s).map_err(|e| format!("{}: {}", key, e))?;
    Ok(minutes_to_time(minutes))
}

fn parse_weekday_set(v: &Value, key: &str) -> Result<Vec<u8>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array", key))?;
    let mut days: Vec<u8> = Vec::with_capacity(arr.len());
    for item in arr {
        let d = parse_i64_range(item, key, 0, i64::from(WEEKDAYS) - 1)? as u8;
        if days.contains(&d) {
            return Err(format!("{} must not repeat a weekday", key));
        }
        days.push(d);
    }
    if days.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    days.sort_unstable();
    Ok(days)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Timetable => match k.as_str() {
                "slotHeightPx" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 8, 400)?));
                }
                "slotMarginPx" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 200)?));
                }
                "minDayHeightPx" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 2000)?));
                }
                "hourWidthPx" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 20, 1000)?));
                }
                "dayStart" | "dayEnd" => {
                    obj.insert(k.clone(), Value::String(parse_clock(v, k)?));
                }
                _ => return Err(format!("unknown timetable field: {}", k)),
            },
            SetupSection::General => match k.as_str() {
                "schoolName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "weekStartsOn" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 1)?));
                }
                "defaultSessionMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 15, 240)?));
                }
                "visibleWeekdays" => {
                    obj.insert(k.clone(), json!(parse_weekday_set(v, k)?));
                }
                _ => return Err(format!("unknown general field: {}", k)),
            },
        }
    }

    if let SetupSection::Timetable = section {
        let start = obj.get("dayStart").and_then(|v| v.as_str()).unwrap_or("");
        let end = obj.get("dayEnd").and_then(|v| v.as_str()).unwrap_or("");
        match (time_to_minutes(start), time_to_minutes(end)) {
            (Ok(s), Ok(e)) if s < e => {}
            _ => return Err("dayStart must be before dayEnd".into()),
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup UI.
            let mut candidate = current.clone();
            if merge_section_patch(section, &mut candidate, saved_obj).is_ok() {
                current = candidate;
            } else {
                tracing::warn!(key = section.key(), "ignoring invalid saved setup section");
            }
        }
    }
    Ok(current)
}

pub fn load_layout_config(conn: &rusqlite::Connection) -> anyhow::Result<LayoutConfig> {
    let value = load_section(conn, SetupSection::Timetable)?;
    serde_json::from_value(value).context("timetable setup does not match layout config")
}

pub fn load_general(conn: &rusqlite::Connection) -> anyhow::Result<GeneralSettings> {
    let value = load_section(conn, SetupSection::General)?;
    serde_json::from_value(value).context("general setup is malformed")
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let timetable = match load_section(conn, SetupSection::Timetable) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let general = match load_section(conn, SetupSection::General) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "timetable": timetable,
            "general": general
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "section": section_raw, "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
