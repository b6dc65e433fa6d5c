use rusqlite::{params, Connection};
use serde_json::json;

use crate::ipc::handlers::overview::{load_thresholds, THRESHOLDS_KEY};
use crate::ipc::helpers::{with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn settings_get(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let thresholds = load_thresholds(conn)?;
    Ok(json!({
        "riskThresholds": { "high": thresholds.high, "medium": thresholds.medium }
    }))
}

fn settings_update(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let raw = params_in
        .get("riskThresholds")
        .ok_or_else(|| HandlerErr::bad_params("missing riskThresholds"))?;
    let high = raw
        .get("high")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params("riskThresholds.high must be a number"))?;
    let medium = raw
        .get("medium")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params("riskThresholds.medium must be a number"))?;
    if !(high > medium && medium > 0.0) {
        return Err(HandlerErr::validation(
            "riskThresholds must satisfy high > medium > 0",
        ));
    }

    let value = json!({ "high": high, "medium": medium }).to_string();
    conn.execute(
        "INSERT INTO tracker_settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![THRESHOLDS_KEY, value],
    )
    .map_err(|e| HandlerErr::db_update(e, "tracker_settings"))?;

    Ok(json!({
        "riskThresholds": { "high": high, "medium": medium }
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(with_db(state, req, settings_get)),
        "settings.update" => Some(with_db(state, req, settings_update)),
        _ => None,
    }
}
