use chrono::{Duration, Utc};
use rusqlite::{types::Value, Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("not_found", message)
    }

    pub fn validation(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("validation_error", message)
    }

    pub fn conflict(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("conflict", message)
    }

    pub fn invalid_transition(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("invalid_transition", message)
    }

    pub fn db_query(e: rusqlite::Error) -> HandlerErr {
        HandlerErr::new("db_query_failed", e.to_string())
    }

    pub fn db_update(e: rusqlite::Error, table: &str) -> HandlerErr {
        HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }

    pub fn db_tx(e: rusqlite::Error) -> HandlerErr {
        HandlerErr::new("db_tx_failed", e.to_string())
    }

    pub fn db_commit(e: rusqlite::Error) -> HandlerErr {
        HandlerErr::new("db_commit_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    /// Per-item error shape used inside batch results.
    pub fn to_json(&self) -> serde_json::Value {
        json!({ "code": self.code, "message": self.message })
    }
}

/// Every data method needs an open workspace; this wraps the handler body in
/// the shared no-workspace check and response mapping.
pub fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_str_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(vec![]),
        Some(v) if v.is_null() => Ok(vec![]),
        Some(v) => {
            let arr = v
                .as_array()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array", key)))?;
            arr.iter()
                .map(|item| {
                    item.as_str().map(|s| s.to_string()).ok_or_else(|| {
                        HandlerErr::bad_params(format!("{} must contain only strings", key))
                    })
                })
                .collect()
        }
    }
}

pub fn get_required_str_list(
    params: &serde_json::Value,
    key: &str,
) -> Result<Vec<String>, HandlerErr> {
    if params.get(key).map(|v| v.is_null()).unwrap_or(true) {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    }
    get_str_list(params, key)
}

pub fn get_opt_usize(params: &serde_json::Value, key: &str) -> Result<Option<usize>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-negative integer", key))),
    }
}

pub fn get_opt_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Looks up a student in the directory projection; `Ok(None)` means unknown.
pub fn lookup_student(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<(String, String)>, HandlerErr> {
    conn.query_row(
        "SELECT name, class_name FROM students WHERE id = ?",
        [student_id],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

/// Parses a JSON-array TEXT column; a NULL or broken cell degrades to empty.
pub fn string_vec_cell(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

/// Placeholder list for a dynamic `IN (...)` clause.
pub fn sql_placeholders(count: usize) -> String {
    let mut s = String::new();
    for i in 0..count {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}

/// Shared aggregation scope: class list, exam participation, time cutoff.
#[derive(Debug, Clone, Default)]
pub struct ScopeFilter {
    pub class_names: Vec<String>,
    pub exam_titles: Vec<String>,
    pub cutoff: Option<String>,
}

impl ScopeFilter {
    pub fn parse(params: &serde_json::Value) -> Result<ScopeFilter, HandlerErr> {
        let class_names = get_str_list(params, "classNames")?;
        let exam_titles = get_str_list(params, "examTitles")?;
        let cutoff = match get_opt_str(params, "timeRange")?.as_deref() {
            None | Some("semester") => None,
            Some("month") => Some(Utc::now() - Duration::days(30)),
            Some("quarter") => Some(Utc::now() - Duration::days(90)),
            Some("year") => Some(Utc::now() - Duration::days(365)),
            Some(other) => {
                return Err(HandlerErr::validation(format!(
                    "unknown timeRange: {}",
                    other
                )))
            }
        }
        .map(|t| t.to_rfc3339());
        Ok(ScopeFilter {
            class_names,
            exam_titles,
            cutoff,
        })
    }

    /// Appends clauses restricting `student_alias` (a table alias exposing
    /// `class_name` and `id`) and an optional timestamp column to this scope.
    /// RFC 3339 UTC strings compare correctly as text.
    pub fn push_clauses(
        &self,
        student_alias: &str,
        time_column: Option<&str>,
        where_parts: &mut Vec<String>,
        params: &mut Vec<Value>,
    ) {
        if !self.class_names.is_empty() {
            where_parts.push(format!(
                "{}.class_name IN ({})",
                student_alias,
                sql_placeholders(self.class_names.len())
            ));
            params.extend(self.class_names.iter().map(|c| Value::Text(c.clone())));
        }
        if !self.exam_titles.is_empty() {
            where_parts.push(format!(
                "{}.id IN (SELECT student_id FROM exam_participation WHERE exam_title IN ({}))",
                student_alias,
                sql_placeholders(self.exam_titles.len())
            ));
            params.extend(self.exam_titles.iter().map(|t| Value::Text(t.clone())));
        }
        if let (Some(cutoff), Some(column)) = (self.cutoff.as_ref(), time_column) {
            where_parts.push(format!("{} >= ?", column));
            params.push(Value::Text(cutoff.clone()));
        }
    }
}

pub fn where_sql(parts: &[String]) -> String {
    if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    }
}
