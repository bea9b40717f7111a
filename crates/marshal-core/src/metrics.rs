//! Windowed operational metrics for the control plane.
//!
//! Aggregates the registry tables, the per-task reviewer artifacts, and
//! the ingress audit log into one report: task flow, policy blocks,
//! approval latency, review-gate quality, dispatch telemetry, chat
//! command health, and incident recovery.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Duration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;

use marshal_db::pool::DbPool;
use marshal_db::queries::ops::{percentile, telemetry_summary, TelemetrySummary};

use crate::config::PlaneConfig;
use crate::error::Result;
use crate::gate::{self, ReviewerVerdict};

/// Options for a metrics run.
///
/// Synthetic traffic (smoke and chaos probes) is classified by an
/// update-id floor and actor/text markers; the thresholds are explicit
/// here because several downstream rates depend on them.
#[derive(Debug, Clone)]
pub struct MetricsOptions {
    pub window_days: i64,
    pub limit_tasks: i64,
    pub synthetic_update_id_floor: i64,
    pub synthetic_markers: Vec<String>,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            window_days: 7,
            limit_tasks: 500,
            synthetic_update_id_floor: 900_000_000,
            synthetic_markers: vec!["smoke".to_owned(), "chaos".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowInfo {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskFlow {
    pub task_count: i64,
    pub status_counts: BTreeMap<String, i64>,
    pub route_counts: BTreeMap<String, i64>,
    pub risk_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyMetrics {
    pub policy_block_count: i64,
    pub policy_reason_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalMetrics {
    pub approval_status_counts: BTreeMap<String, i64>,
    pub median_approval_latency_minutes: f64,
    pub p90_approval_latency_minutes: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewGateMetrics {
    pub heavy_task_count: i64,
    pub gate_pass_count: i64,
    pub gate_fail_count: i64,
    pub gate_missing_count: i64,
    pub gate_pass_rate: f64,
    pub review_reason_counts: BTreeMap<String, i64>,
    pub review_schema_complete_count: i64,
    pub review_schema_complete_rate: f64,
    pub fail_then_pass_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMetrics {
    pub command_count: i64,
    pub command_counts: BTreeMap<String, i64>,
    pub status_counts: BTreeMap<String, i64>,
    pub success_rate: f64,
    pub error_rate: f64,
    pub unauthorized_count: i64,
    pub command_timeout_count: i64,
    pub poll_error_count: i64,
    pub poll_recovered_count: i64,
    /// poll_recovered / poll_error over the window; 1.0 when no incidents.
    pub incident_recovery_rate: f64,
    pub synthetic_count: i64,
}

/// The full report.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub generated_at: String,
    pub window: WindowInfo,
    pub task_flow: TaskFlow,
    pub policy: PolicyMetrics,
    pub approvals: ApprovalMetrics,
    pub review_gate: ReviewGateMetrics,
    pub telemetry: TelemetrySummary,
    pub chat: ChatMetrics,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn parse_minutes(start: &str, end: &str) -> Option<f64> {
    let start = chrono::DateTime::parse_from_rfc3339(start).ok()?;
    let end = chrono::DateTime::parse_from_rfc3339(end).ok()?;
    let delta = end.signed_duration_since(start);
    if delta.num_milliseconds() < 0 {
        return None;
    }
    Some(delta.num_milliseconds() as f64 / 60_000.0)
}

/// Build the windowed metrics report.
pub async fn build_report(
    db: &DbPool,
    config: &PlaneConfig,
    audit_log: &Path,
    opts: &MetricsOptions,
) -> Result<MetricsReport> {
    let end = Utc::now();
    let start = end - Duration::days(opts.window_days.max(1));
    let start_s = start.to_rfc3339_opts(SecondsFormat::Micros, false);
    let end_s = end.to_rfc3339_opts(SecondsFormat::Micros, false);

    let task_rows = sqlx::query(
        "SELECT task_id, task_type, route_class, status, risk_level, created_at \
         FROM tasks WHERE created_at >= ? AND created_at <= ? \
         ORDER BY created_at DESC LIMIT ?",
    )
    .bind(&start_s)
    .bind(&end_s)
    .bind(opts.limit_tasks)
    .fetch_all(db)
    .await
    .map_err(marshal_db::RegistryError::from)?;

    let mut status_counts = BTreeMap::new();
    let mut route_counts = BTreeMap::new();
    let mut risk_counts = BTreeMap::new();
    let mut heavy_task_count = 0i64;
    let mut gate_pass = 0i64;
    let mut gate_fail = 0i64;
    let mut gate_missing = 0i64;
    let mut review_reason_counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut schema_complete = 0i64;

    for row in &task_rows {
        let task_id: String = row.try_get("task_id").map_err(marshal_db::RegistryError::from)?;
        let route: String = row.try_get("route_class").map_err(marshal_db::RegistryError::from)?;
        let status: String = row.try_get("status").map_err(marshal_db::RegistryError::from)?;
        let risk: String = row.try_get("risk_level").map_err(marshal_db::RegistryError::from)?;

        *status_counts.entry(status).or_insert(0) += 1;
        *route_counts.entry(route.clone()).or_insert(0) += 1;
        *risk_counts.entry(risk).or_insert(0) += 1;

        if route == "HEAVY" {
            heavy_task_count += 1;
            let report = gate::evaluate_artifacts(&config.artifact_dir(&task_id));
            match report.reviewer_verdict {
                ReviewerVerdict::Pass => gate_pass += 1,
                ReviewerVerdict::Fail => gate_fail += 1,
                ReviewerVerdict::Missing | ReviewerVerdict::Invalid => gate_missing += 1,
            }
            if let Some(reason) = report.reason_code {
                *review_reason_counts.entry(reason).or_insert(0) += 1;
            }
            if report.checklist_complete {
                schema_complete += 1;
            }
        }
    }

    // Policy blocks.
    let policy_rows = sqlx::query(
        "SELECT detail FROM task_events \
         WHERE created_at >= ? AND created_at <= ? \
           AND event_type = 'router' AND detail LIKE 'policy_block reason=%'",
    )
    .bind(&start_s)
    .bind(&end_s)
    .fetch_all(db)
    .await
    .map_err(marshal_db::RegistryError::from)?;
    let mut policy_reason_counts: BTreeMap<String, i64> = BTreeMap::new();
    for row in &policy_rows {
        let detail: String = row.try_get("detail").map_err(marshal_db::RegistryError::from)?;
        let reason = detail
            .strip_prefix("policy_block reason=")
            .unwrap_or("unknown")
            .trim()
            .to_owned();
        *policy_reason_counts.entry(reason).or_insert(0) += 1;
    }

    // Approvals and decision latency.
    let approval_rows = sqlx::query(
        "SELECT status, created_at, updated_at FROM approvals \
         WHERE created_at >= ? AND created_at <= ?",
    )
    .bind(&start_s)
    .bind(&end_s)
    .fetch_all(db)
    .await
    .map_err(marshal_db::RegistryError::from)?;
    let mut approval_status_counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut approval_latency = Vec::new();
    for row in &approval_rows {
        let status: String = row.try_get("status").map_err(marshal_db::RegistryError::from)?;
        let created: String = row.try_get("created_at").map_err(marshal_db::RegistryError::from)?;
        let updated: String = row.try_get("updated_at").map_err(marshal_db::RegistryError::from)?;
        if matches!(status.as_str(), "approved" | "rejected") {
            if let Some(minutes) = parse_minutes(&created, &updated) {
                approval_latency.push(minutes);
            }
        }
        *approval_status_counts.entry(status).or_insert(0) += 1;
    }

    // fail-then-pass review timelines.
    let review_rows = sqlx::query(
        "SELECT task_id, detail FROM task_events \
         WHERE created_at >= ? AND created_at <= ? \
           AND event_type = 'router' AND detail LIKE 'reviewer_artifact_recorded verdict=%' \
         ORDER BY id ASC",
    )
    .bind(&start_s)
    .bind(&end_s)
    .fetch_all(db)
    .await
    .map_err(marshal_db::RegistryError::from)?;
    let mut timelines: BTreeMap<String, Vec<&'static str>> = BTreeMap::new();
    for row in &review_rows {
        let task_id: String = row.try_get("task_id").map_err(marshal_db::RegistryError::from)?;
        let detail: String = row.try_get("detail").map_err(marshal_db::RegistryError::from)?;
        if detail.contains("verdict=fail") {
            timelines.entry(task_id).or_default().push("fail");
        } else if detail.contains("verdict=pass") {
            timelines.entry(task_id).or_default().push("pass");
        }
    }
    let fail_then_pass_count = timelines
        .values()
        .filter(|timeline| {
            let fail = timeline.iter().position(|v| *v == "fail");
            let pass = timeline.iter().position(|v| *v == "pass");
            matches!((fail, pass), (Some(f), Some(p)) if f < p)
        })
        .count() as i64;

    // Chat audit rows.
    let chat = chat_metrics(audit_log, &start_s, &end_s, opts);

    let telemetry = telemetry_summary(db, opts.limit_tasks).await?;

    Ok(MetricsReport {
        generated_at: marshal_db::models::utc_now(),
        window: WindowInfo {
            start: start_s,
            end: end_s,
        },
        task_flow: TaskFlow {
            task_count: task_rows.len() as i64,
            status_counts,
            route_counts,
            risk_counts,
        },
        policy: PolicyMetrics {
            policy_block_count: policy_rows.len() as i64,
            policy_reason_counts,
        },
        approvals: ApprovalMetrics {
            approval_status_counts,
            median_approval_latency_minutes: round2(percentile(&approval_latency, 0.50)),
            p90_approval_latency_minutes: round2(percentile(&approval_latency, 0.90)),
        },
        review_gate: ReviewGateMetrics {
            heavy_task_count,
            gate_pass_count: gate_pass,
            gate_fail_count: gate_fail,
            gate_missing_count: gate_missing,
            gate_pass_rate: if heavy_task_count > 0 {
                round4(gate_pass as f64 / heavy_task_count as f64)
            } else {
                0.0
            },
            review_reason_counts,
            review_schema_complete_count: schema_complete,
            review_schema_complete_rate: if heavy_task_count > 0 {
                round4(schema_complete as f64 / heavy_task_count as f64)
            } else {
                0.0
            },
            fail_then_pass_count,
        },
        telemetry,
        chat,
    })
}

fn chat_metrics(audit_log: &Path, start: &str, end: &str, opts: &MetricsOptions) -> ChatMetrics {
    let mut command_counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut status_counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut synthetic_count = 0i64;
    let mut update_total = 0i64;

    let content = std::fs::read_to_string(audit_log).unwrap_or_default();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(row) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let ts = row.get("ts").and_then(Value::as_str).unwrap_or("");
        if ts < start || ts > end {
            continue;
        }

        let status = row
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        *status_counts.entry(status).or_insert(0) += 1;

        if row.get("update_id").is_some() {
            update_total += 1;
            if is_synthetic(&row, opts) {
                synthetic_count += 1;
            }
        }

        if let Some(text) = row.get("text").and_then(Value::as_str) {
            let trimmed = text.trim();
            if trimmed.starts_with('/') {
                let cmd = trimmed
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .split('@')
                    .next()
                    .unwrap_or("")
                    .to_lowercase();
                *command_counts.entry(cmd).or_insert(0) += 1;
            }
        }
    }

    let count_of = |counts: &BTreeMap<String, i64>, key: &str| counts.get(key).copied().unwrap_or(0);
    let ok = count_of(&status_counts, "ok");
    let errors = count_of(&status_counts, "error");
    let timeouts = count_of(&status_counts, "command_timeout");
    let poll_errors = count_of(&status_counts, "poll_error");
    let poll_recovered = count_of(&status_counts, "poll_recovered");
    let unauthorized = count_of(&status_counts, "unauthorized");

    ChatMetrics {
        command_count: command_counts.values().sum(),
        command_counts,
        status_counts,
        success_rate: if update_total > 0 {
            round4(ok as f64 / update_total as f64)
        } else {
            0.0
        },
        error_rate: if update_total > 0 {
            round4((errors + timeouts) as f64 / update_total as f64)
        } else {
            0.0
        },
        unauthorized_count: unauthorized,
        command_timeout_count: timeouts,
        poll_error_count: poll_errors,
        poll_recovered_count: poll_recovered,
        incident_recovery_rate: if poll_errors > 0 {
            round4((poll_recovered.min(poll_errors)) as f64 / poll_errors as f64)
        } else {
            1.0
        },
        synthetic_count,
    }
}

/// Smoke/chaos probes stamp themselves with very large update ids and
/// recognizable actor/text markers.
fn is_synthetic(row: &Value, opts: &MetricsOptions) -> bool {
    if row
        .get("update_id")
        .and_then(Value::as_i64)
        .map(|id| id >= opts.synthetic_update_id_floor)
        .unwrap_or(false)
    {
        return true;
    }
    let haystacks = ["actor", "text"];
    haystacks.iter().any(|field| {
        row.get(*field)
            .and_then(Value::as_str)
            .map(|value| {
                let value = value.to_lowercase();
                opts.synthetic_markers.iter().any(|marker| value.contains(marker))
            })
            .unwrap_or(false)
    })
}
