use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::helpers::{
    get_opt_str, get_required_str, get_str_list, lookup_student, now_rfc3339, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::WarningDetails;

fn rows_array<'a>(
    params_in: &'a serde_json::Value,
) -> Result<&'a Vec<serde_json::Value>, HandlerErr> {
    params_in
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing rows array"))
}

/// Directory projection upsert. The daemon never edits students itself; this
/// is the only way rows get here.
fn sync_students(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let rows = rows_array(params_in)?;
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let mut upserted = 0usize;
    for row in rows {
        let student_id = get_required_str(row, "studentId")?;
        let name = get_required_str(row, "name")?;
        let class_name = get_required_str(row, "className")?;
        tx.execute(
            "INSERT INTO students(id, name, class_name) VALUES(?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, class_name = excluded.class_name",
            params![student_id, name, class_name],
        )
        .map_err(|e| HandlerErr::db_update(e, "students"))?;
        upserted += 1;
    }
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "upserted": upserted }))
}

/// Timestamp columns are compared and MAX'd as text, so every stored value
/// must be in the same offset. Rebase caller-supplied timestamps to UTC.
fn normalize_rfc3339(raw: &str, field: &str) -> Result<String, HandlerErr> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|_| HandlerErr::validation(format!("{} is not RFC 3339: {}", field, raw)))?;
    Ok(parsed.with_timezone(&Utc).to_rfc3339())
}

fn parse_created_at(row: &serde_json::Value) -> Result<String, HandlerErr> {
    match get_opt_str(row, "createdAt")? {
        None => Ok(now_rfc3339()),
        Some(raw) => normalize_rfc3339(&raw, "createdAt"),
    }
}

fn ingest_warning(conn: &Connection, row: &serde_json::Value) -> Result<String, HandlerErr> {
    let student_id = get_required_str(row, "studentId")?;
    let details_raw = row
        .get("details")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing details"))?;
    // Reject payloads that do not fit the tagged shape; a loose bag of fields
    // here would leak into every consumer downstream.
    let details: WarningDetails = serde_json::from_value(details_raw)
        .map_err(|e| HandlerErr::validation(format!("malformed details: {}", e)))?;
    let created_at = parse_created_at(row)?;
    let warning_id =
        get_opt_str(row, "warningId")?.unwrap_or_else(|| Uuid::new_v4().to_string());

    if lookup_student(conn, &student_id)?.is_none() {
        return Err(HandlerErr::not_found(format!(
            "student not found: {}",
            student_id
        )));
    }
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM warning_records WHERE id = ?",
            [&warning_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_some() {
        return Err(HandlerErr::conflict(format!(
            "warning already ingested: {}",
            warning_id
        )));
    }

    conn.execute(
        "INSERT INTO warning_records(id, student_id, details, status, created_at)
         VALUES(?, ?, ?, 'active', ?)",
        params![
            warning_id,
            student_id,
            serde_json::to_string(&details)
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?,
            created_at,
        ],
    )
    .map_err(|e| HandlerErr::db_update(e, "warning_records"))?;
    Ok(warning_id)
}

/// New warning records from the detection pipeline. Per-row outcomes; a bad
/// row never blocks the rest of the batch.
fn sync_warnings(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let rows = rows_array(params_in)?;
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let mut results: Vec<serde_json::Value> = Vec::with_capacity(rows.len());
    let mut inserted = 0usize;
    for (index, row) in rows.iter().enumerate() {
        match ingest_warning(&tx, row) {
            Ok(warning_id) => {
                inserted += 1;
                results.push(json!({
                    "index": index,
                    "warningId": warning_id,
                    "success": true,
                }));
            }
            Err(e) => results.push(json!({
                "index": index,
                "success": false,
                "error": e.to_json(),
            })),
        }
    }
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "inserted": inserted, "results": results }))
}

fn ingest_risk_score(conn: &Connection, row: &serde_json::Value) -> Result<(), HandlerErr> {
    let student_id = get_required_str(row, "studentId")?;
    let score = row
        .get("score")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params("score must be a number"))?;
    if !(0.0..=100.0).contains(&score) {
        return Err(HandlerErr::validation(format!(
            "score out of range: {}",
            score
        )));
    }
    let factors = get_str_list(row, "riskFactors")?;
    let computed_at = match get_opt_str(row, "computedAt")? {
        None => now_rfc3339(),
        Some(raw) => normalize_rfc3339(&raw, "computedAt")?,
    };

    if lookup_student(conn, &student_id)?.is_none() {
        return Err(HandlerErr::not_found(format!(
            "student not found: {}",
            student_id
        )));
    }
    conn.execute(
        "INSERT INTO risk_scores(student_id, score, factors, computed_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET
           score = excluded.score,
           factors = excluded.factors,
           computed_at = excluded.computed_at",
        params![
            student_id,
            score,
            serde_json::to_string(&factors).unwrap_or_else(|_| "[]".to_string()),
            computed_at,
        ],
    )
    .map_err(|e| HandlerErr::db_update(e, "risk_scores"))?;
    Ok(())
}

/// Scoring-provider output, one row per student, newest publication wins.
fn sync_risk_scores(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let rows = rows_array(params_in)?;
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let mut results: Vec<serde_json::Value> = Vec::with_capacity(rows.len());
    let mut upserted = 0usize;
    for (index, row) in rows.iter().enumerate() {
        match ingest_risk_score(&tx, row) {
            Ok(()) => {
                upserted += 1;
                results.push(json!({ "index": index, "success": true }));
            }
            Err(e) => results.push(json!({
                "index": index,
                "success": false,
                "error": e.to_json(),
            })),
        }
    }
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "upserted": upserted, "results": results }))
}

/// Bulk registry adds from the recommendation pipeline. Each row goes through
/// the same path as priority.add with sourceType forced to "algorithm", so an
/// already-tracked student surfaces as a per-row conflict instead of a second
/// active entry.
fn sync_priority_recommendations(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let rows = rows_array(params_in)?;
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let mut results: Vec<serde_json::Value> = Vec::with_capacity(rows.len());
    let mut added = 0usize;
    for (index, row) in rows.iter().enumerate() {
        let mut row = row.clone();
        if let Some(obj) = row.as_object_mut() {
            obj.insert("sourceType".to_string(), json!("algorithm"));
        }
        match super::priority::priority_add(&tx, &row) {
            Ok(result) => {
                added += 1;
                results.push(json!({
                    "index": index,
                    "entryId": result["entry"]["id"],
                    "success": true,
                }));
            }
            Err(e) => results.push(json!({
                "index": index,
                "success": false,
                "error": e.to_json(),
            })),
        }
    }
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "added": added, "results": results }))
}

fn sync_exam_participation(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let rows = rows_array(params_in)?;
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let mut upserted = 0usize;
    let mut skipped = 0usize;
    for row in rows {
        let student_id = get_required_str(row, "studentId")?;
        let exam_title = get_required_str(row, "examTitle")?;
        if lookup_student(&tx, &student_id)?.is_none() {
            skipped += 1;
            continue;
        }
        tx.execute(
            "INSERT OR IGNORE INTO exam_participation(student_id, exam_title) VALUES(?, ?)",
            params![student_id, exam_title],
        )
        .map_err(|e| HandlerErr::db_update(e, "exam_participation"))?;
        upserted += 1;
    }
    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "upserted": upserted, "skippedUnknownStudents": skipped }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sync.students" => Some(with_db(state, req, sync_students)),
        "sync.warnings" => Some(with_db(state, req, sync_warnings)),
        "sync.riskScores" => Some(with_db(state, req, sync_risk_scores)),
        "sync.priorityRecommendations" => {
            Some(with_db(state, req, sync_priority_recommendations))
        }
        "sync.examParticipation" => Some(with_db(state, req, sync_exam_participation)),
        _ => None,
    }
}
