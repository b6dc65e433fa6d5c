use std::collections::HashMap;

use chrono::{DateTime, Local};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::helpers::{
    get_opt_usize, string_vec_cell, where_sql, with_db, HandlerErr, ScopeFilter,
};
use crate::ipc::types::{AppState, Request};
use crate::merge::{
    dashboard_stats, merge_enhanced, ActiveEntry, EnhancedPriorityStudent, RiskSignal, Thresholds,
    WarningSnapshotRow, WarningStats,
};
use crate::model::{PriorityLevel, WarningStatus};

pub const THRESHOLDS_KEY: &str = "risk_thresholds";
const DEFAULT_LIMIT: usize = 20;

pub fn load_thresholds(conn: &Connection) -> Result<Thresholds, HandlerErr> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM tracker_settings WHERE key = ?",
            [THRESHOLDS_KEY],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(raw) = raw else {
        return Ok(Thresholds::default());
    };
    let parsed: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("corrupt thresholds: {}", e)))?;
    let defaults = Thresholds::default();
    Ok(Thresholds {
        high: parsed["high"].as_f64().unwrap_or(defaults.high),
        medium: parsed["medium"].as_f64().unwrap_or(defaults.medium),
    })
}

/// Scoring-provider read. Callers treat a failure here as "no score
/// available" rather than aborting the aggregation.
fn fetch_risk_signals(
    conn: &Connection,
    scope: &ScopeFilter,
) -> Result<Vec<RiskSignal>, HandlerErr> {
    let mut where_parts: Vec<String> = Vec::new();
    let mut sql_params: Vec<Value> = Vec::new();
    scope.push_clauses("s", Some("r.computed_at"), &mut where_parts, &mut sql_params);

    let mut stmt = conn
        .prepare(&format!(
            "SELECT r.student_id, s.name, s.class_name, r.score, r.factors
             FROM risk_scores r JOIN students s ON s.id = r.student_id{}",
            where_sql(&where_parts)
        ))
        .map_err(HandlerErr::db_query)?;
    stmt.query_map(params_from_iter(sql_params.iter()), |r| {
        Ok(RiskSignal {
            student_id: r.get(0)?,
            student_name: r.get(1)?,
            class_name: r.get(2)?,
            score: r.get(3)?,
            factors: string_vec_cell(r.get(4)?),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db_query)
}

/// Active registry entries, scoped by class only: a manually tracked student
/// stays visible regardless of the exam or time window being inspected.
fn fetch_active_entries(
    conn: &Connection,
    scope: &ScopeFilter,
) -> Result<Vec<ActiveEntry>, HandlerErr> {
    let class_scope = ScopeFilter {
        class_names: scope.class_names.clone(),
        ..ScopeFilter::default()
    };
    let mut where_parts: Vec<String> = vec!["p.is_active = 1".to_string()];
    let mut sql_params: Vec<Value> = Vec::new();
    class_scope.push_clauses("s", None, &mut where_parts, &mut sql_params);

    let mut stmt = conn
        .prepare(&format!(
            "SELECT p.id, p.student_id, s.name, s.class_name, p.source_type, p.priority_level,
                    p.category, p.custom_tags, p.intervention_goals, p.notes,
                    p.reason_description, p.follow_up_end_date, p.created_at
             FROM priority_entries p JOIN students s ON s.id = p.student_id{}",
            where_sql(&where_parts)
        ))
        .map_err(HandlerErr::db_query)?;
    stmt.query_map(params_from_iter(sql_params.iter()), |r| {
        let level_raw: String = r.get(5)?;
        Ok(ActiveEntry {
            entry_id: r.get(0)?,
            student_id: r.get(1)?,
            student_name: r.get(2)?,
            class_name: r.get(3)?,
            source_type: r.get(4)?,
            priority_level: PriorityLevel::parse(&level_raw).unwrap_or(PriorityLevel::Medium),
            category: r.get(6)?,
            custom_tags: string_vec_cell(r.get(7)?),
            intervention_goals: string_vec_cell(r.get(8)?),
            notes: r.get(9)?,
            reason_description: r.get(10)?,
            follow_up_end_date: r.get(11)?,
            created_at: r.get(12)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db_query)
}

fn fetch_warning_stats(
    conn: &Connection,
    scope: &ScopeFilter,
) -> Result<Vec<WarningStats>, HandlerErr> {
    let mut where_parts: Vec<String> = Vec::new();
    let mut sql_params: Vec<Value> = Vec::new();
    scope.push_clauses("s", Some("w.created_at"), &mut where_parts, &mut sql_params);

    let mut stmt = conn
        .prepare(&format!(
            "SELECT w.student_id, s.name, s.class_name,
                    SUM(CASE WHEN w.status = 'active' THEN 1 ELSE 0 END),
                    COUNT(*), MAX(w.created_at)
             FROM warning_records w JOIN students s ON s.id = w.student_id{}
             GROUP BY w.student_id",
            where_sql(&where_parts)
        ))
        .map_err(HandlerErr::db_query)?;
    let mut stats = stmt
        .query_map(params_from_iter(sql_params.iter()), |r| {
            Ok(WarningStats {
                student_id: r.get(0)?,
                student_name: r.get(1)?,
                class_name: r.get(2)?,
                active_count: r.get::<_, Option<i64>>(3)?.unwrap_or(0),
                total_count: r.get(4)?,
                latest_warning_at: r.get(5)?,
                intervention_count: 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut where_parts: Vec<String> = Vec::new();
    let mut sql_params: Vec<Value> = Vec::new();
    let class_scope = ScopeFilter {
        class_names: scope.class_names.clone(),
        ..ScopeFilter::default()
    };
    class_scope.push_clauses("s", None, &mut where_parts, &mut sql_params);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT i.student_id, COUNT(*)
             FROM interventions i JOIN students s ON s.id = i.student_id{}
             GROUP BY i.student_id",
            where_sql(&where_parts)
        ))
        .map_err(HandlerErr::db_query)?;
    let counts: HashMap<String, i64> = stmt
        .query_map(params_from_iter(sql_params.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(HandlerErr::db_query)?;
    for st in &mut stats {
        st.intervention_count = counts.get(&st.student_id).copied().unwrap_or(0);
    }
    Ok(stats)
}

/// The three fetches plus the pure merge. The scoring provider degrades to
/// empty; the warning store and registry are first-party and fail the call.
fn compute_enhanced(
    conn: &Connection,
    scope: &ScopeFilter,
) -> Result<Vec<EnhancedPriorityStudent>, HandlerErr> {
    let thresholds = load_thresholds(conn)?;
    let signals = match fetch_risk_signals(conn, scope) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!(
                "warningd: scoring provider unavailable, ranking on priority only: {}",
                e.message
            );
            vec![]
        }
    };
    let entries = fetch_active_entries(conn, scope)?;
    let stats = fetch_warning_stats(conn, scope)?;
    Ok(merge_enhanced(signals, entries, stats, &thresholds))
}

fn student_json(s: &EnhancedPriorityStudent) -> serde_json::Value {
    json!({
        "studentId": s.student_id,
        "studentName": s.student_name,
        "className": s.class_name,
        "algorithmicRiskScore": s.algorithmic_risk_score,
        "riskFactors": s.risk_factors,
        "finalPriority": s.final_priority.as_str(),
        "isPriorityActive": s.is_priority_active,
        "activeWarningsCount": s.active_warnings_count,
        "totalWarningsCount": s.total_warnings_count,
        "interventionCount": s.intervention_count,
        "latestWarningDate": s.latest_warning_date,
        "priorityEntry": s.entry.as_ref().map(|e| json!({
            "id": e.entry_id,
            "sourceType": e.source_type,
            "priorityLevel": e.priority_level.as_str(),
            "category": e.category,
            "customTags": e.custom_tags,
            "interventionGoals": e.intervention_goals,
            "notes": e.notes,
            "reasonDescription": e.reason_description,
            "followUpEndDate": e.follow_up_end_date,
            "createdAt": e.created_at,
        })),
    })
}

fn overview_priority_students(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let scope = ScopeFilter::parse(params_in)?;
    let limit = get_opt_usize(params_in, "limit")?.unwrap_or(DEFAULT_LIMIT);
    let mut students = compute_enhanced(conn, &scope)?;
    students.truncate(limit);
    Ok(json!({
        "students": students.iter().map(student_json).collect::<Vec<_>>()
    }))
}

fn fetch_warning_snapshot(
    conn: &Connection,
    scope: &ScopeFilter,
) -> Result<Vec<WarningSnapshotRow>, HandlerErr> {
    let mut where_parts: Vec<String> = Vec::new();
    let mut sql_params: Vec<Value> = Vec::new();
    scope.push_clauses("s", Some("w.created_at"), &mut where_parts, &mut sql_params);

    let mut stmt = conn
        .prepare(&format!(
            "SELECT w.status, w.resolved_at
             FROM warning_records w JOIN students s ON s.id = w.student_id{}",
            where_sql(&where_parts)
        ))
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map(params_from_iter(sql_params.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(rows
        .into_iter()
        .filter_map(|(status_raw, resolved_at)| {
            let status = WarningStatus::parse(&status_raw)?;
            let resolved_on = resolved_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Local).date_naive());
            Some(WarningSnapshotRow {
                status,
                resolved_on,
            })
        })
        .collect())
}

/// Counters and ranked list come out of one snapshot: the same connection,
/// the same scope, one call.
fn overview_dashboard_stats(
    conn: &Connection,
    params_in: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let scope = ScopeFilter::parse(params_in)?;
    let students = compute_enhanced(conn, &scope)?;
    let warnings = fetch_warning_snapshot(conn, &scope)?;
    let today = Local::now().date_naive();
    let stats = dashboard_stats(&warnings, &students, today);
    Ok(json!({
        "activeWarnings": stats.active_warnings,
        "highPriorityStudents": stats.high_priority_students,
        "totalAtRiskStudents": stats.total_at_risk_students,
        "resolvedToday": stats.resolved_today,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "overview.priorityStudents" => Some(with_db(state, req, overview_priority_students)),
        "overview.dashboardStats" => Some(with_db(state, req, overview_dashboard_stats)),
        _ => None,
    }
}
