use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::helpers::{
    get_opt_bool, get_opt_str, get_required_str, get_str_list, lookup_student, now_rfc3339,
    string_vec_cell, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::PriorityLevel;

struct EntryRow {
    id: String,
    student_id: String,
    student_name: String,
    class_name: String,
    source_type: String,
    priority_level: String,
    category: Option<String>,
    custom_tags: Vec<String>,
    intervention_goals: Vec<String>,
    notes: Option<String>,
    reason_description: String,
    follow_up_end_date: Option<String>,
    created_at: String,
    is_active: bool,
    removed_at: Option<String>,
}

impl EntryRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "studentName": self.student_name,
            "className": self.class_name,
            "sourceType": self.source_type,
            "priorityLevel": self.priority_level,
            "category": self.category,
            "customTags": self.custom_tags,
            "interventionGoals": self.intervention_goals,
            "notes": self.notes,
            "reasonDescription": self.reason_description,
            "followUpEndDate": self.follow_up_end_date,
            "createdAt": self.created_at,
            "isActive": self.is_active,
            "removedAt": self.removed_at,
        })
    }
}

const ENTRY_COLUMNS: &str = "p.id, p.student_id, s.name, s.class_name, p.source_type, \
     p.priority_level, p.category, p.custom_tags, p.intervention_goals, p.notes, \
     p.reason_description, p.follow_up_end_date, p.created_at, p.is_active, p.removed_at";

fn entry_from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        class_name: r.get(3)?,
        source_type: r.get(4)?,
        priority_level: r.get(5)?,
        category: r.get(6)?,
        custom_tags: string_vec_cell(r.get(7)?),
        intervention_goals: string_vec_cell(r.get(8)?),
        notes: r.get(9)?,
        reason_description: r.get(10)?,
        follow_up_end_date: r.get(11)?,
        created_at: r.get(12)?,
        is_active: r.get::<_, i64>(13)? != 0,
        removed_at: r.get(14)?,
    })
}

fn fetch_entry(conn: &Connection, entry_id: &str) -> Result<Option<EntryRow>, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM priority_entries p JOIN students s ON s.id = p.student_id WHERE p.id = ?",
            ENTRY_COLUMNS
        ),
        [entry_id],
        entry_from_sql,
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn parse_level(raw: &str) -> Result<PriorityLevel, HandlerErr> {
    PriorityLevel::parse(raw)
        .ok_or_else(|| HandlerErr::validation(format!("unknown priority level: {}", raw)))
}

/// One active entry per student. Adding to an already-tracked student is
/// rejected with `conflict`; edits go through priority.update instead.
/// Also the per-row body of the bulk `sync.priorityRecommendations` ingest.
pub(super) fn priority_add(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params_in, "studentId")?;
    let level = parse_level(&get_required_str(params_in, "priorityLevel")?)?;
    let reason = get_required_str(params_in, "reasonDescription")?;
    if reason.trim().is_empty() {
        return Err(HandlerErr::validation(
            "reasonDescription must not be empty",
        ));
    }
    let source_type = get_opt_str(params_in, "sourceType")?.unwrap_or_else(|| "manual".to_string());
    if !matches!(source_type.as_str(), "manual" | "algorithm") {
        return Err(HandlerErr::validation(format!(
            "unknown sourceType: {}",
            source_type
        )));
    }
    let tags = get_str_list(params_in, "customTags")?;
    let goals = get_str_list(params_in, "interventionGoals")?;
    let category = get_opt_str(params_in, "category")?;
    let follow_up_end = get_opt_str(params_in, "followUpEndDate")?;
    let notes = get_opt_str(params_in, "notes")?;

    if lookup_student(conn, &student_id)?.is_none() {
        return Err(HandlerErr::not_found(format!(
            "student not found: {}",
            student_id
        )));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM priority_entries WHERE student_id = ? AND is_active = 1",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if let Some(entry_id) = existing {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("student {} is already tracked", student_id),
            details: Some(json!({ "entryId": entry_id })),
        });
    }

    let entry_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO priority_entries(
            id, student_id, source_type, priority_level, category, custom_tags,
            intervention_goals, notes, reason_description, follow_up_end_date,
            created_at, is_active, removed_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, NULL)",
        params![
            entry_id,
            student_id,
            source_type,
            level.as_str(),
            category,
            serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string(&goals).unwrap_or_else(|_| "[]".to_string()),
            notes,
            reason,
            follow_up_end,
            now,
        ],
    )
    .map_err(|e| HandlerErr::db_update(e, "priority_entries"))?;

    let entry = fetch_entry(conn, &entry_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "inserted entry missing"))?;
    Ok(json!({ "entry": entry.to_json() }))
}

const MUTABLE_FIELDS: &[&str] = &[
    "priorityLevel",
    "category",
    "customTags",
    "followUpEndDate",
    "interventionGoals",
    "notes",
];

fn priority_update(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let entry_id = get_required_str(params_in, "entryId")?;
    let patch = params_in
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing patch object"))?;
    if patch.is_empty() {
        return Err(HandlerErr::validation("patch must not be empty"));
    }
    // studentId, sourceType, createdAt and reasonDescription are immutable;
    // naming them (or anything unknown) fails loudly instead of dropping edits.
    for key in patch.keys() {
        if !MUTABLE_FIELDS.contains(&key.as_str()) {
            return Err(HandlerErr::validation(format!(
                "field is not updatable: {}",
                key
            )));
        }
    }

    let Some(existing) = fetch_entry(conn, &entry_id)? else {
        return Err(HandlerErr::not_found(format!(
            "priority entry not found: {}",
            entry_id
        )));
    };
    if !existing.is_active {
        return Err(HandlerErr::not_found(format!(
            "priority entry not found: {}",
            entry_id
        )));
    }

    let patch_value = serde_json::Value::Object(patch.clone());
    let level = match get_opt_str(&patch_value, "priorityLevel")? {
        Some(raw) => parse_level(&raw)?.as_str().to_string(),
        None => existing.priority_level.clone(),
    };
    let category = if patch.contains_key("category") {
        get_opt_str(&patch_value, "category")?
    } else {
        existing.category.clone()
    };
    let tags = if patch.contains_key("customTags") {
        get_str_list(&patch_value, "customTags")?
    } else {
        existing.custom_tags.clone()
    };
    let goals = if patch.contains_key("interventionGoals") {
        get_str_list(&patch_value, "interventionGoals")?
    } else {
        existing.intervention_goals.clone()
    };
    let follow_up_end = if patch.contains_key("followUpEndDate") {
        get_opt_str(&patch_value, "followUpEndDate")?
    } else {
        existing.follow_up_end_date.clone()
    };
    let notes = if patch.contains_key("notes") {
        get_opt_str(&patch_value, "notes")?
    } else {
        existing.notes.clone()
    };

    conn.execute(
        "UPDATE priority_entries
         SET priority_level = ?, category = ?, custom_tags = ?, intervention_goals = ?,
             follow_up_end_date = ?, notes = ?
         WHERE id = ?",
        params![
            level,
            category,
            serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string(&goals).unwrap_or_else(|_| "[]".to_string()),
            follow_up_end,
            notes,
            entry_id,
        ],
    )
    .map_err(|e| HandlerErr::db_update(e, "priority_entries"))?;

    let entry = fetch_entry(conn, &entry_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated entry missing"))?;
    Ok(json!({ "entry": entry.to_json() }))
}

/// Soft delete. History stays; removing an already-removed entry is a no-op.
fn priority_remove(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let entry_id = get_required_str(params_in, "entryId")?;
    let Some(existing) = fetch_entry(conn, &entry_id)? else {
        return Err(HandlerErr::not_found(format!(
            "priority entry not found: {}",
            entry_id
        )));
    };
    if existing.is_active {
        conn.execute(
            "UPDATE priority_entries SET is_active = 0, removed_at = ? WHERE id = ?",
            params![now_rfc3339(), entry_id],
        )
        .map_err(|e| HandlerErr::db_update(e, "priority_entries"))?;
    }
    Ok(json!({ "entryId": entry_id, "isActive": false }))
}

fn priority_list(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_opt_str(params_in, "studentId")?;
    let include_inactive = get_opt_bool(params_in, "includeInactive")?.unwrap_or(false);

    let mut sql = format!(
        "SELECT {} FROM priority_entries p JOIN students s ON s.id = p.student_id",
        ENTRY_COLUMNS
    );
    let mut clauses: Vec<&str> = Vec::new();
    if student_id.is_some() {
        clauses.push("p.student_id = ?");
    }
    if !include_inactive {
        clauses.push("p.is_active = 1");
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY p.created_at DESC, p.id ASC");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let entries = match student_id {
        Some(sid) => stmt
            .query_map([&sid], entry_from_sql)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], entry_from_sql)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "entries": entries.iter().map(|e| e.to_json()).collect::<Vec<_>>()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "priority.add" => Some(with_db(state, req, priority_add)),
        "priority.update" => Some(with_db(state, req, priority_update)),
        "priority.remove" => Some(with_db(state, req, priority_remove)),
        "priority.list" => Some(with_db(state, req, priority_list)),
        _ => None,
    }
}
