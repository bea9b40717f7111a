//! Planner/reviewer artifact gate for HEAVY tasks.
//!
//! Reads `planner.md` and `reviewer.json` from a task's artifact
//! directory and judges whether the review gate passes. The reviewer file
//! is parsed leniently: unreadable JSON yields an `invalid` verdict
//! rather than an error, so a corrupt artifact blocks dispatch instead of
//! crashing the router.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of reviewer failure reason codes.
pub const REVIEW_REASON_CODES: &[&str] = &[
    "policy_conflict",
    "missing_tests",
    "insufficient_plan",
    "high_risk_unmitigated",
    "artifact_incomplete",
    "other",
];

/// The five required reviewer checklist keys.
pub const CHECKLIST_KEYS: &[&str] = &[
    "policy_safety",
    "correctness",
    "tests",
    "rollback",
    "approval_constraints",
];

/// Planner artifact file name inside the artifact directory.
pub const PLANNER_FILE: &str = "planner.md";
/// Reviewer artifact file name inside the artifact directory.
pub const REVIEWER_FILE: &str = "reviewer.json";

/// What the reviewer artifact says, or why it cannot say anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerVerdict {
    Pass,
    Fail,
    Missing,
    Invalid,
}

impl fmt::Display for ReviewerVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Missing => "missing",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// The reviewer artifact as written by `record_review`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerArtifact {
    pub reviewer: String,
    pub verdict: String,
    #[serde(default)]
    pub reason_code: String,
    pub checklist: serde_json::Map<String, Value>,
    #[serde(default)]
    pub notes: String,
    pub recorded_at: String,
}

/// Gate judgement for a task.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub planner_present: bool,
    pub reviewer_present: bool,
    pub reviewer_verdict: ReviewerVerdict,
    pub reason_code: Option<String>,
    pub checklist_complete: bool,
    pub gate_passed: bool,
}

impl GateReport {
    /// Short structured reason for event details and operator replies.
    pub fn reason(&self) -> String {
        format!(
            "planner={} reviewer={} verdict={} checklist_complete={}",
            self.planner_present, self.reviewer_present, self.reviewer_verdict,
            self.checklist_complete
        )
    }
}

/// Evaluate the gate for a task's artifact directory.
pub fn evaluate_artifacts(artifact_dir: &Path) -> GateReport {
    let planner_present = artifact_dir.join(PLANNER_FILE).is_file();
    let reviewer_path = artifact_dir.join(REVIEWER_FILE);
    let reviewer_present = reviewer_path.is_file();

    let (reviewer_verdict, reason_code, checklist_complete) = if !reviewer_present {
        (ReviewerVerdict::Missing, None, false)
    } else {
        match read_reviewer(&reviewer_path) {
            Some(payload) => summarize_reviewer(&payload),
            None => (ReviewerVerdict::Invalid, None, false),
        }
    };

    let gate_passed = planner_present
        && reviewer_present
        && reviewer_verdict == ReviewerVerdict::Pass
        && checklist_complete;

    GateReport {
        planner_present,
        reviewer_present,
        reviewer_verdict,
        reason_code,
        checklist_complete,
        gate_passed,
    }
}

fn read_reviewer(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn summarize_reviewer(payload: &Value) -> (ReviewerVerdict, Option<String>, bool) {
    let verdict = match payload
        .get("verdict")
        .and_then(Value::as_str)
        .map(|v| v.trim().to_lowercase())
        .as_deref()
    {
        Some("pass") => ReviewerVerdict::Pass,
        Some("fail") => ReviewerVerdict::Fail,
        _ => ReviewerVerdict::Invalid,
    };

    let reason_code = payload
        .get("reason_code")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned);

    let checklist_complete = payload
        .get("checklist")
        .and_then(Value::as_object)
        .map(|checklist| {
            CHECKLIST_KEYS
                .iter()
                .all(|key| matches!(checklist.get(*key), Some(Value::Bool(_))))
        })
        .unwrap_or(false);

    (verdict, reason_code, checklist_complete)
}
