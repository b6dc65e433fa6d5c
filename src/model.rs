use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    High,
    Medium,
    Low,
}

impl PriorityLevel {
    /// Higher rank sorts first in the enhanced list.
    pub fn rank(self) -> u8 {
        match self {
            PriorityLevel::High => 2,
            PriorityLevel::Medium => 1,
            PriorityLevel::Low => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityLevel::High => "high",
            PriorityLevel::Medium => "medium",
            PriorityLevel::Low => "low",
        }
    }

    pub fn parse(raw: &str) -> Option<PriorityLevel> {
        match raw {
            "high" => Some(PriorityLevel::High),
            "medium" => Some(PriorityLevel::Medium),
            "low" => Some(PriorityLevel::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningStatus {
    Active,
    Resolved,
    Dismissed,
}

impl WarningStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WarningStatus::Active => "active",
            WarningStatus::Resolved => "resolved",
            WarningStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(raw: &str) -> Option<WarningStatus> {
        match raw {
            "active" => Some(WarningStatus::Active),
            "resolved" => Some(WarningStatus::Resolved),
            "dismissed" => Some(WarningStatus::Dismissed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, WarningStatus::Active)
    }
}

/// Rule-kind-specific trigger payload. New rule kinds get a new variant here
/// rather than loose fields on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RuleTrigger {
    GradeDrop {
        subject: String,
        score_delta: f64,
        exam_refs: Vec<String>,
    },
    ConsecutiveFails {
        subject: String,
        fail_count: u32,
        exam_refs: Vec<String>,
    },
    LowAttendance {
        attendance_ratio: f64,
        window_days: u32,
    },
}

/// Structured warning payload, tagged by its producer. Both variants carry
/// `rule_name` and `severity`; everything else is reached through a match on
/// the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "generatedBy", rename_all_fields = "camelCase")]
pub enum WarningDetails {
    #[serde(rename = "rule-engine")]
    RuleEngine {
        rule_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_description: Option<String>,
        severity: Severity,
        trigger: RuleTrigger,
    },
    #[serde(rename = "ml-model")]
    MlModel {
        rule_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_description: Option<String>,
        severity: Severity,
        risk_score: f64,
        risk_factors: Vec<String>,
    },
}
