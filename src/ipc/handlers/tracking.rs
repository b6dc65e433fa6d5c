use rusqlite::{params, Connection};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::helpers::{
    get_opt_bool, get_opt_str, get_required_str, lookup_student, now_rfc3339, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

const INTERVENTION_TYPES: &[&str] = &[
    "meeting",
    "phone_call",
    "counseling",
    "tutoring",
    "family_contact",
    "other",
];

const NOTE_TYPES: &[&str] = &["observation", "progress", "concern", "improvement", "other"];

fn tracking_add_intervention(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params_in, "studentId")?;
    let intervention_type = get_required_str(params_in, "interventionType")?;
    if !INTERVENTION_TYPES.contains(&intervention_type.as_str()) {
        return Err(HandlerErr::validation(format!(
            "unknown interventionType: {}",
            intervention_type
        )));
    }
    let description = get_required_str(params_in, "description")?;
    if description.trim().is_empty() {
        return Err(HandlerErr::validation("description must not be empty"));
    }
    let result = get_opt_str(params_in, "result")?;
    let follow_up_required = get_opt_bool(params_in, "followUpRequired")?.unwrap_or(false);
    let created_by = get_required_str(params_in, "createdBy")?;

    if lookup_student(conn, &student_id)?.is_none() {
        return Err(HandlerErr::not_found(format!(
            "student not found: {}",
            student_id
        )));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO interventions(
            id, student_id, intervention_type, description, result,
            follow_up_required, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            student_id,
            intervention_type,
            description,
            result,
            follow_up_required as i64,
            created_by,
            now,
        ],
    )
    .map_err(|e| HandlerErr::db_update(e, "interventions"))?;

    Ok(json!({
        "id": id,
        "studentId": student_id,
        "interventionType": intervention_type,
        "description": description,
        "result": result,
        "followUpRequired": follow_up_required,
        "createdBy": created_by,
        "createdAt": now,
    }))
}

fn tracking_add_note(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params_in, "studentId")?;
    let note_type = get_required_str(params_in, "noteType")?;
    if !NOTE_TYPES.contains(&note_type.as_str()) {
        return Err(HandlerErr::validation(format!(
            "unknown noteType: {}",
            note_type
        )));
    }
    let content = get_required_str(params_in, "content")?;
    if content.trim().is_empty() {
        return Err(HandlerErr::validation("content must not be empty"));
    }
    let is_private = get_opt_bool(params_in, "isPrivate")?.unwrap_or(false);
    let created_by = get_required_str(params_in, "createdBy")?;

    if lookup_student(conn, &student_id)?.is_none() {
        return Err(HandlerErr::not_found(format!(
            "student not found: {}",
            student_id
        )));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO tracking_notes(
            id, student_id, note_type, content, is_private, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            student_id,
            note_type,
            content,
            is_private as i64,
            created_by,
            now,
        ],
    )
    .map_err(|e| HandlerErr::db_update(e, "tracking_notes"))?;

    Ok(json!({
        "id": id,
        "studentId": student_id,
        "noteType": note_type,
        "content": content,
        "isPrivate": is_private,
        "createdBy": created_by,
        "createdAt": now,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "tracking.addIntervention" => Some(with_db(state, req, tracking_add_intervention)),
        "tracking.addNote" => Some(with_db(state, req, tracking_add_note)),
        _ => None,
    }
}
