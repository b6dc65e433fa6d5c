use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::model::{PriorityLevel, WarningStatus};

/// Score-to-priority thresholds. Configuration, not a constant: the handler
/// loads these from tracker_settings before each aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub high: f64,
    pub medium: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            high: 70.0,
            medium: 40.0,
        }
    }
}

impl Thresholds {
    pub fn priority_for_score(&self, score: f64) -> PriorityLevel {
        if score >= self.high {
            PriorityLevel::High
        } else if score >= self.medium {
            PriorityLevel::Medium
        } else {
            PriorityLevel::Low
        }
    }
}

/// One row of scoring-provider output, already joined to the directory.
#[derive(Debug, Clone)]
pub struct RiskSignal {
    pub student_id: String,
    pub student_name: String,
    pub class_name: String,
    pub score: f64,
    pub factors: Vec<String>,
}

/// An active priority registry entry, joined to the directory.
#[derive(Debug, Clone)]
pub struct ActiveEntry {
    pub entry_id: String,
    pub student_id: String,
    pub student_name: String,
    pub class_name: String,
    pub source_type: String,
    pub priority_level: PriorityLevel,
    pub category: Option<String>,
    pub custom_tags: Vec<String>,
    pub intervention_goals: Vec<String>,
    pub notes: Option<String>,
    pub reason_description: String,
    pub follow_up_end_date: Option<String>,
    pub created_at: String,
}

/// Per-student warning/intervention counters from the warning store.
#[derive(Debug, Clone)]
pub struct WarningStats {
    pub student_id: String,
    pub student_name: String,
    pub class_name: String,
    pub active_count: i64,
    pub total_count: i64,
    pub latest_warning_at: Option<String>,
    pub intervention_count: i64,
}

/// The derived view. Recomputed on every query, never stored.
#[derive(Debug, Clone)]
pub struct EnhancedPriorityStudent {
    pub student_id: String,
    pub student_name: String,
    pub class_name: String,
    pub algorithmic_risk_score: f64,
    pub risk_factors: Vec<String>,
    pub final_priority: PriorityLevel,
    pub is_priority_active: bool,
    pub active_warnings_count: i64,
    pub total_warnings_count: i64,
    pub intervention_count: i64,
    pub latest_warning_date: Option<String>,
    pub entry: Option<ActiveEntry>,
}

struct Joined {
    student_name: String,
    class_name: String,
    signal: Option<RiskSignal>,
    entry: Option<ActiveEntry>,
    stats: Option<WarningStats>,
}

/// Outer-join the three sources by student id and resolve the final priority.
/// A manual (or any active) registry entry wins over the score-derived level;
/// students present in only one source still appear.
pub fn merge_enhanced(
    signals: Vec<RiskSignal>,
    entries: Vec<ActiveEntry>,
    stats: Vec<WarningStats>,
    thresholds: &Thresholds,
) -> Vec<EnhancedPriorityStudent> {
    let mut joined: BTreeMap<String, Joined> = BTreeMap::new();

    for signal in signals {
        let key = signal.student_id.clone();
        let name = signal.student_name.clone();
        let class = signal.class_name.clone();
        let slot = joined.entry(key).or_insert_with(|| Joined {
            student_name: name,
            class_name: class,
            signal: None,
            entry: None,
            stats: None,
        });
        slot.signal = Some(signal);
    }
    for entry in entries {
        let key = entry.student_id.clone();
        let name = entry.student_name.clone();
        let class = entry.class_name.clone();
        let slot = joined.entry(key).or_insert_with(|| Joined {
            student_name: name,
            class_name: class,
            signal: None,
            entry: None,
            stats: None,
        });
        slot.entry = Some(entry);
    }
    for st in stats {
        let key = st.student_id.clone();
        let name = st.student_name.clone();
        let class = st.class_name.clone();
        let slot = joined.entry(key).or_insert_with(|| Joined {
            student_name: name,
            class_name: class,
            signal: None,
            entry: None,
            stats: None,
        });
        slot.stats = Some(st);
    }

    let mut result: Vec<EnhancedPriorityStudent> = joined
        .into_iter()
        .map(|(student_id, row)| {
            let score = row.signal.as_ref().map(|s| s.score).unwrap_or(0.0);
            let factors = row
                .signal
                .as_ref()
                .map(|s| s.factors.clone())
                .unwrap_or_default();
            let final_priority = match row.entry.as_ref() {
                Some(entry) => entry.priority_level,
                None => thresholds.priority_for_score(score),
            };
            let (active_count, total_count, intervention_count, latest) = row
                .stats
                .as_ref()
                .map(|s| {
                    (
                        s.active_count,
                        s.total_count,
                        s.intervention_count,
                        s.latest_warning_at.clone(),
                    )
                })
                .unwrap_or((0, 0, 0, None));
            EnhancedPriorityStudent {
                student_id,
                student_name: row.student_name,
                class_name: row.class_name,
                algorithmic_risk_score: score,
                risk_factors: factors,
                final_priority,
                is_priority_active: row.entry.is_some(),
                active_warnings_count: active_count,
                total_warnings_count: total_count,
                intervention_count,
                latest_warning_date: latest,
                entry: row.entry,
            }
        })
        .collect();

    result.sort_by(|a, b| {
        b.final_priority
            .rank()
            .cmp(&a.final_priority.rank())
            .then_with(|| {
                b.algorithmic_risk_score
                    .partial_cmp(&a.algorithmic_risk_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.student_name.cmp(&b.student_name))
    });
    result
}

/// A warning record reduced to what the dashboard needs. `resolved_on` is the
/// local calendar day the record was resolved, if any.
#[derive(Debug, Clone, Copy)]
pub struct WarningSnapshotRow {
    pub status: WarningStatus,
    pub resolved_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DashboardStats {
    pub active_warnings: i64,
    pub high_priority_students: i64,
    pub total_at_risk_students: i64,
    pub resolved_today: i64,
}

/// Pure counters over an already-fetched snapshot; no extra queries so the
/// numbers always match the list rendered from the same data.
pub fn dashboard_stats(
    warnings: &[WarningSnapshotRow],
    students: &[EnhancedPriorityStudent],
    today: NaiveDate,
) -> DashboardStats {
    DashboardStats {
        active_warnings: warnings
            .iter()
            .filter(|w| w.status == WarningStatus::Active)
            .count() as i64,
        high_priority_students: students
            .iter()
            .filter(|s| s.final_priority == PriorityLevel::High)
            .count() as i64,
        total_at_risk_students: students.len() as i64,
        resolved_today: warnings
            .iter()
            .filter(|w| w.status == WarningStatus::Resolved && w.resolved_on == Some(today))
            .count() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(id: &str, name: &str, score: f64) -> RiskSignal {
        RiskSignal {
            student_id: id.to_string(),
            student_name: name.to_string(),
            class_name: "9A".to_string(),
            score,
            factors: vec!["grades".to_string()],
        }
    }

    fn entry(id: &str, name: &str, level: PriorityLevel) -> ActiveEntry {
        ActiveEntry {
            entry_id: format!("entry-{}", id),
            student_id: id.to_string(),
            student_name: name.to_string(),
            class_name: "9A".to_string(),
            source_type: "manual".to_string(),
            priority_level: level,
            category: None,
            custom_tags: vec![],
            intervention_goals: vec![],
            notes: None,
            reason_description: "manual flag".to_string(),
            follow_up_end_date: None,
            created_at: "2026-01-10T08:00:00Z".to_string(),
        }
    }

    fn stats(id: &str, name: &str, active: i64, total: i64) -> WarningStats {
        WarningStats {
            student_id: id.to_string(),
            student_name: name.to_string(),
            class_name: "9A".to_string(),
            active_count: active,
            total_count: total,
            latest_warning_at: Some("2026-02-01T09:00:00Z".to_string()),
            intervention_count: 1,
        }
    }

    #[test]
    fn manual_entry_overrides_score_derived_priority() {
        let merged = merge_enhanced(
            vec![signal("s1", "Avery", 95.0)],
            vec![entry("s1", "Avery", PriorityLevel::Low)],
            vec![],
            &Thresholds::default(),
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].final_priority, PriorityLevel::Low);
        assert!(merged[0].is_priority_active);
        assert_eq!(merged[0].algorithmic_risk_score, 95.0);
    }

    #[test]
    fn outer_join_keeps_single_source_students() {
        let merged = merge_enhanced(
            vec![signal("s1", "Avery", 80.0)],
            vec![entry("s2", "Blair", PriorityLevel::Medium)],
            vec![stats("s3", "Casey", 2, 5)],
            &Thresholds::default(),
        );
        assert_eq!(merged.len(), 3);

        let score_only = merged.iter().find(|s| s.student_id == "s1").expect("s1");
        assert!(!score_only.is_priority_active);
        assert!(score_only.entry.is_none());
        assert_eq!(score_only.final_priority, PriorityLevel::High);

        let entry_only = merged.iter().find(|s| s.student_id == "s2").expect("s2");
        assert_eq!(entry_only.algorithmic_risk_score, 0.0);
        assert!(entry_only.is_priority_active);

        let warnings_only = merged.iter().find(|s| s.student_id == "s3").expect("s3");
        assert_eq!(warnings_only.active_warnings_count, 2);
        assert_eq!(warnings_only.total_warnings_count, 5);
        assert_eq!(warnings_only.final_priority, PriorityLevel::Low);
    }

    #[test]
    fn all_three_sources_land_on_one_row() {
        let merged = merge_enhanced(
            vec![signal("s1", "Avery", 45.0)],
            vec![entry("s1", "Avery", PriorityLevel::High)],
            vec![stats("s1", "Avery", 1, 4)],
            &Thresholds::default(),
        );
        assert_eq!(merged.len(), 1);
        let row = &merged[0];
        assert_eq!(row.algorithmic_risk_score, 45.0);
        assert_eq!(row.final_priority, PriorityLevel::High);
        assert_eq!(row.active_warnings_count, 1);
        assert_eq!(row.total_warnings_count, 4);
        assert_eq!(row.intervention_count, 1);
        assert_eq!(
            row.entry.as_ref().map(|e| e.entry_id.as_str()),
            Some("entry-s1")
        );
    }

    #[test]
    fn ordering_is_priority_then_score_then_name() {
        let merged = merge_enhanced(
            vec![
                signal("s1", "Zoe", 50.0),
                signal("s2", "Ann", 50.0),
                signal("s3", "Mia", 90.0),
                signal("s4", "Ben", 10.0),
            ],
            vec![],
            vec![],
            &Thresholds::default(),
        );
        let names: Vec<&str> = merged.iter().map(|s| s.student_name.as_str()).collect();
        // Mia is high; Ann and Zoe tie at medium/50 and break on name; Ben is low.
        assert_eq!(names, vec!["Mia", "Ann", "Zoe", "Ben"]);
    }

    #[test]
    fn threshold_boundaries_are_inclusive() {
        let t = Thresholds::default();
        assert_eq!(t.priority_for_score(70.0), PriorityLevel::High);
        assert_eq!(t.priority_for_score(69.9), PriorityLevel::Medium);
        assert_eq!(t.priority_for_score(40.0), PriorityLevel::Medium);
        assert_eq!(t.priority_for_score(39.9), PriorityLevel::Low);
        assert_eq!(t.priority_for_score(0.0), PriorityLevel::Low);
    }

    #[test]
    fn dashboard_counters_come_from_one_snapshot() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 29).expect("date");
        let yesterday = NaiveDate::from_ymd_opt(2026, 8, 28).expect("date");
        let warnings = vec![
            WarningSnapshotRow {
                status: WarningStatus::Active,
                resolved_on: None,
            },
            WarningSnapshotRow {
                status: WarningStatus::Active,
                resolved_on: None,
            },
            WarningSnapshotRow {
                status: WarningStatus::Resolved,
                resolved_on: Some(today),
            },
            WarningSnapshotRow {
                status: WarningStatus::Resolved,
                resolved_on: Some(yesterday),
            },
            WarningSnapshotRow {
                status: WarningStatus::Dismissed,
                resolved_on: Some(today),
            },
        ];
        let students = merge_enhanced(
            vec![signal("s1", "Avery", 85.0), signal("s2", "Blair", 20.0)],
            vec![],
            vec![],
            &Thresholds::default(),
        );
        let counters = dashboard_stats(&warnings, &students, today);
        assert_eq!(counters.active_warnings, 2);
        assert_eq!(counters.high_priority_students, 1);
        assert_eq!(counters.total_at_risk_students, 2);
        // Dismissals do not count as resolved, and yesterday's resolution is out.
        assert_eq!(counters.resolved_today, 1);
    }
}
