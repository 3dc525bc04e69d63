use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{db_conn, parse_weekday};
use crate::ipc::types::{AppState, Request};
use crate::layout::{self, LayoutConfig, WEEKDAYS};
use serde_json::json;

fn config_json(config: &LayoutConfig) -> serde_json::Value {
    let mut value = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
    value["gridWidthPx"] = json!(config.grid_width());
    value
}

fn handle_timetable_day(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let config = match setup::load_layout_config(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let sessions = match db::load_sessions(conn, Some(weekday)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let day = layout::layout_day(weekday, &sessions, &config);
    ok(
        &req.id,
        json!({ "config": config_json(&config), "day": day }),
    )
}

/// Visible weekdays in display order, honoring the configured first day.
fn display_weekdays(visible: &[u8], week_starts_on: u8) -> Vec<u8> {
    let mut days: Vec<u8> = visible.iter().copied().filter(|d| *d < WEEKDAYS).collect();
    days.sort_by_key(|d| (*d + WEEKDAYS - week_starts_on % WEEKDAYS) % WEEKDAYS);
    days.dedup();
    days
}

fn handle_timetable_week(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let config = match setup::load_layout_config(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let general = match setup::load_general(conn) {
        Ok(g) => g,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let sessions = match db::load_sessions(conn, None) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let include_hidden = req
        .params
        .get("includeHidden")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let order = if include_hidden {
        display_weekdays(&[0, 1, 2, 3, 4, 5, 6], general.week_starts_on)
    } else {
        display_weekdays(&general.visible_weekdays, general.week_starts_on)
    };

    let week = layout::layout_week(&sessions, &config);
    let days: Vec<&layout::DayLayout> = order
        .iter()
        .filter_map(|d| week.get(usize::from(*d)))
        .collect();
    let hidden_sessions = sessions
        .iter()
        .filter(|s| !order.contains(&s.weekday))
        .count();

    ok(
        &req.id,
        json!({
            "schoolName": general.school_name,
            "config": config_json(&config),
            "days": days,
            "hiddenSessionCount": hidden_sessions
        }),
    )
}

fn handle_timetable_conflicts(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let sessions = match db::load_sessions(conn, None) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut conflicts = Vec::new();
    for weekday in 0..WEEKDAYS {
        let day: Vec<_> = sessions
            .iter()
            .filter(|s| s.weekday == weekday)
            .cloned()
            .collect();
        for (a, b) in layout::overlapping_pairs(&day) {
            conflicts.push(json!({ "weekday": weekday, "sessionIds": [a, b] }));
        }
    }

    ok(&req.id, json!({ "conflicts": conflicts }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.day" => Some(handle_timetable_day(state, req)),
        "timetable.week" => Some(handle_timetable_week(state, req)),
        "timetable.conflicts" => Some(handle_timetable_conflicts(state, req)),
        _ => None,
    }
}
