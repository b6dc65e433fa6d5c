use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::helpers::{
    get_opt_str, get_opt_usize, get_required_str, get_required_str_list, get_str_list,
    lookup_student, now_rfc3339, sql_placeholders, where_sql, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::WarningStatus;

struct WarningRow {
    id: String,
    student_id: String,
    student_name: String,
    class_name: String,
    details: serde_json::Value,
    status: String,
    created_at: String,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
    resolution_note: Option<String>,
}

impl WarningRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "studentName": self.student_name,
            "className": self.class_name,
            "details": self.details,
            "status": self.status,
            "createdAt": self.created_at,
            "resolvedAt": self.resolved_at,
            "resolvedBy": self.resolved_by,
            "resolutionNote": self.resolution_note,
        })
    }
}

const ROW_COLUMNS: &str = "w.id, w.student_id, s.name, s.class_name, w.details, w.status, \
     w.created_at, w.resolved_at, w.resolved_by, w.resolution_note";

fn row_from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<WarningRow> {
    let details_raw: String = r.get(4)?;
    Ok(WarningRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        class_name: r.get(3)?,
        details: serde_json::from_str(&details_raw).unwrap_or(serde_json::Value::Null),
        status: r.get(5)?,
        created_at: r.get(6)?,
        resolved_at: r.get(7)?,
        resolved_by: r.get(8)?,
        resolution_note: r.get(9)?,
    })
}

fn warnings_list(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let limit = get_opt_usize(params_in, "limit")?.unwrap_or(50);
    let offset = get_opt_usize(params_in, "offset")?.unwrap_or(0);

    let mut where_parts: Vec<String> = Vec::new();
    let mut sql_params: Vec<Value> = Vec::new();

    if let Some(status) = get_opt_str(params_in, "status")? {
        if WarningStatus::parse(&status).is_none() {
            return Err(HandlerErr::validation(format!("unknown status: {}", status)));
        }
        where_parts.push("w.status = ?".to_string());
        sql_params.push(Value::Text(status));
    }
    if let Some(severity) = get_opt_str(params_in, "severity")? {
        if !matches!(severity.as_str(), "high" | "medium" | "low") {
            return Err(HandlerErr::validation(format!(
                "unknown severity: {}",
                severity
            )));
        }
        where_parts.push("json_extract(w.details, '$.severity') = ?".to_string());
        sql_params.push(Value::Text(severity));
    }
    if let Some(class_name) = get_opt_str(params_in, "className")? {
        where_parts.push("s.class_name = ?".to_string());
        sql_params.push(Value::Text(class_name));
    }
    let exam_titles = get_str_list(params_in, "examTitles")?;
    if !exam_titles.is_empty() {
        where_parts.push(format!(
            "w.student_id IN (SELECT student_id FROM exam_participation WHERE exam_title IN ({}))",
            sql_placeholders(exam_titles.len())
        ));
        sql_params.extend(exam_titles.into_iter().map(Value::Text));
    }
    if let Some(term) = get_opt_str(params_in, "searchTerm")? {
        let needle = format!("%{}%", term.to_lowercase());
        where_parts.push(
            "(LOWER(s.name) LIKE ? OR LOWER(s.class_name) LIKE ? \
             OR LOWER(COALESCE(json_extract(w.details, '$.ruleName'), '')) LIKE ?)"
                .to_string(),
        );
        sql_params.push(Value::Text(needle.clone()));
        sql_params.push(Value::Text(needle.clone()));
        sql_params.push(Value::Text(needle));
    }

    let where_clause = where_sql(&where_parts);

    let total: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM warning_records w JOIN students s ON s.id = w.student_id{}",
                where_clause
            ),
            params_from_iter(sql_params.iter()),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM warning_records w JOIN students s ON s.id = w.student_id{} \
             ORDER BY w.created_at DESC, w.id ASC LIMIT ? OFFSET ?",
            ROW_COLUMNS, where_clause
        ))
        .map_err(HandlerErr::db_query)?;
    sql_params.push(Value::Integer(limit as i64));
    sql_params.push(Value::Integer(offset as i64));
    let records = stmt
        .query_map(params_from_iter(sql_params.iter()), row_from_sql)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "records": records.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
        "total": total,
    }))
}

fn current_status(
    conn: &Connection,
    warning_id: &str,
) -> Result<Option<WarningStatus>, HandlerErr> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM warning_records WHERE id = ?",
            [warning_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    match raw {
        None => Ok(None),
        Some(s) => WarningStatus::parse(&s)
            .map(Some)
            .ok_or_else(|| HandlerErr::new("db_query_failed", format!("corrupt status: {}", s))),
    }
}

fn append_audit(
    conn: &Connection,
    warning_id: &str,
    actor: &str,
    from: WarningStatus,
    to: WarningStatus,
    note: Option<&str>,
    at: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO warning_audit(id, warning_id, actor, from_status, to_status, note, at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![
            Uuid::new_v4().to_string(),
            warning_id,
            actor,
            from.as_str(),
            to.as_str(),
            note,
            at
        ],
    )
    .map_err(|e| HandlerErr::db_update(e, "warning_audit"))?;
    Ok(())
}

/// `active -> resolved|dismissed`. Re-applying the same terminal action is an
/// idempotent success that leaves resolved_at untouched; crossing between the
/// two terminal states requires an undo first.
fn apply_resolve(
    conn: &Connection,
    warning_id: &str,
    action: WarningStatus,
    note: Option<&str>,
    actor: &str,
) -> Result<WarningStatus, HandlerErr> {
    let Some(current) = current_status(conn, warning_id)? else {
        return Err(HandlerErr::not_found(format!(
            "warning not found: {}",
            warning_id
        )));
    };
    if current == action {
        return Ok(current);
    }
    if current.is_terminal() {
        return Err(HandlerErr::invalid_transition(format!(
            "cannot move {} directly to {}; undo first",
            current.as_str(),
            action.as_str()
        )));
    }

    let now = now_rfc3339();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    tx.execute(
        "UPDATE warning_records
         SET status = ?, resolved_at = ?, resolved_by = ?, resolution_note = ?
         WHERE id = ?",
        params![action.as_str(), now, actor, note, warning_id],
    )
    .map_err(|e| HandlerErr::db_update(e, "warning_records"))?;
    append_audit(&tx, warning_id, actor, current, action, note, &now)?;
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(action)
}

/// `resolved|dismissed -> active`, clearing the resolution trail fields.
fn apply_undo(
    conn: &Connection,
    warning_id: &str,
    actor: &str,
) -> Result<WarningStatus, HandlerErr> {
    let Some(current) = current_status(conn, warning_id)? else {
        return Err(HandlerErr::not_found(format!(
            "warning not found: {}",
            warning_id
        )));
    };
    if current == WarningStatus::Active {
        return Err(HandlerErr::invalid_transition(
            "warning is already active".to_string(),
        ));
    }

    let now = now_rfc3339();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    tx.execute(
        "UPDATE warning_records
         SET status = 'active', resolved_at = NULL, resolved_by = NULL, resolution_note = NULL
         WHERE id = ?",
        [warning_id],
    )
    .map_err(|e| HandlerErr::db_update(e, "warning_records"))?;
    append_audit(
        &tx,
        warning_id,
        actor,
        current,
        WarningStatus::Active,
        None,
        &now,
    )?;
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(WarningStatus::Active)
}

fn parse_action(params: &serde_json::Value) -> Result<WarningStatus, HandlerErr> {
    let raw = get_required_str(params, "action")?;
    match WarningStatus::parse(&raw) {
        Some(status) if status.is_terminal() => Ok(status),
        _ => Err(HandlerErr::validation(format!(
            "action must be resolved or dismissed, got {}",
            raw
        ))),
    }
}

fn warnings_resolve(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let warning_id = get_required_str(params, "warningId")?;
    let action = parse_action(params)?;
    let note = get_opt_str(params, "note")?;
    let actor = get_required_str(params, "actorId")?;
    let status = apply_resolve(conn, &warning_id, action, note.as_deref(), &actor)?;
    Ok(json!({ "warningId": warning_id, "status": status.as_str() }))
}

fn warnings_undo(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let warning_id = get_required_str(params, "warningId")?;
    let actor = get_required_str(params, "actorId")?;
    let status = apply_undo(conn, &warning_id, &actor)?;
    Ok(json!({ "warningId": warning_id, "status": status.as_str() }))
}

/// Per-id outcomes in input order; one item's failure never aborts the rest.
fn batch_results<F>(ids: Vec<String>, mut op: F) -> Vec<serde_json::Value>
where
    F: FnMut(&str) -> Result<WarningStatus, HandlerErr>,
{
    ids.iter()
        .map(|id| match op(id) {
            Ok(status) => json!({
                "warningId": id,
                "success": true,
                "status": status.as_str(),
            }),
            Err(e) => json!({
                "warningId": id,
                "success": false,
                "error": e.to_json(),
            }),
        })
        .collect()
}

fn warnings_batch_resolve(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ids = get_required_str_list(params, "warningIds")?;
    let action = parse_action(params)?;
    let note = get_opt_str(params, "note")?;
    let actor = get_required_str(params, "actorId")?;
    let results = batch_results(ids, |id| {
        apply_resolve(conn, id, action, note.as_deref(), &actor)
    });
    Ok(json!({ "results": results }))
}

fn warnings_batch_undo(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ids = get_required_str_list(params, "warningIds")?;
    let actor = get_required_str(params, "actorId")?;
    let results = batch_results(ids, |id| apply_undo(conn, id, &actor));
    Ok(json!({ "results": results }))
}

fn warnings_history(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let warning_id = get_required_str(params, "warningId")?;
    if current_status(conn, &warning_id)?.is_none() {
        return Err(HandlerErr::not_found(format!(
            "warning not found: {}",
            warning_id
        )));
    }
    let mut stmt = conn
        .prepare(
            "SELECT actor, from_status, to_status, note, at
             FROM warning_audit WHERE warning_id = ? ORDER BY at ASC, id ASC",
        )
        .map_err(HandlerErr::db_query)?;
    let entries = stmt
        .query_map([&warning_id], |r| {
            Ok(json!({
                "actor": r.get::<_, String>(0)?,
                "fromStatus": r.get::<_, String>(1)?,
                "toStatus": r.get::<_, String>(2)?,
                "note": r.get::<_, Option<String>>(3)?,
                "at": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "warningId": warning_id, "entries": entries }))
}

fn warnings_student_profile(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some((name, class_name)) = lookup_student(conn, &student_id)? else {
        return Err(HandlerErr::not_found(format!(
            "student not found: {}",
            student_id
        )));
    };

    let (total, active, resolved, last_at): (i64, i64, i64, Option<String>) = conn
        .query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'resolved' THEN 1 ELSE 0 END),
                    MAX(created_at)
             FROM warning_records WHERE student_id = ?",
            [&student_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    r.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    r.get(3)?,
                ))
            },
        )
        .map_err(HandlerErr::db_query)?;

    let risk_level = if active >= 3 {
        "high"
    } else if active >= 1 {
        "medium"
    } else {
        "low"
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, intervention_type, description, result, follow_up_required, created_by, created_at
             FROM interventions WHERE student_id = ? ORDER BY created_at DESC",
        )
        .map_err(HandlerErr::db_query)?;
    let interventions = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "interventionType": r.get::<_, String>(1)?,
                "description": r.get::<_, String>(2)?,
                "result": r.get::<_, Option<String>>(3)?,
                "followUpRequired": r.get::<_, i64>(4)? != 0,
                "createdBy": r.get::<_, String>(5)?,
                "createdAt": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, note_type, content, is_private, created_by, created_at
             FROM tracking_notes WHERE student_id = ? ORDER BY created_at DESC",
        )
        .map_err(HandlerErr::db_query)?;
    let notes = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "noteType": r.get::<_, String>(1)?,
                "content": r.get::<_, String>(2)?,
                "isPrivate": r.get::<_, i64>(3)? != 0,
                "createdBy": r.get::<_, String>(4)?,
                "createdAt": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "studentId": student_id,
        "studentName": name,
        "className": class_name,
        "totalWarnings": total,
        "activeWarnings": active,
        "resolvedWarnings": resolved,
        "lastWarningDate": last_at,
        "riskLevel": risk_level,
        "interventions": interventions,
        "trackingNotes": notes,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "warnings.list" => Some(with_db(state, req, warnings_list)),
        "warnings.resolve" => Some(with_db(state, req, warnings_resolve)),
        "warnings.undo" => Some(with_db(state, req, warnings_undo)),
        "warnings.batchResolve" => Some(with_db(state, req, warnings_batch_resolve)),
        "warnings.batchUndo" => Some(with_db(state, req, warnings_batch_undo)),
        "warnings.history" => Some(with_db(state, req, warnings_history)),
        "warnings.studentProfile" => Some(with_db(state, req, warnings_student_profile)),
        _ => None,
    }
}
