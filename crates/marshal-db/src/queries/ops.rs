//! Operational health and telemetry aggregation.
//!
//! `ops_summary` inspects the lease, idempotency, and event tables for a
//! recent window and folds in the ingress audit log for command timeouts
//! and poll incidents. `telemetry_summary` aggregates the metadata fields
//! the router merges after each dispatch.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Duration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;

use crate::error::Result;
use crate::models::LeaseStatus;
use crate::pool::DbPool;

use super::leases::row_to_lease;
use super::tasks::row_to_task;

#[derive(Debug, Clone, Serialize)]
pub struct LeaseHealth {
    pub queued: i64,
    pub running: i64,
    /// Running leases whose expiry has already passed.
    pub stale: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdempotencyHealth {
    pub conflict_window: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeoutHealth {
    pub dispatch_window: i64,
    pub command_window: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollingHealth {
    pub poll_error_window: i64,
    pub poll_recovered_window: i64,
}

/// Health summary over a recent time window.
#[derive(Debug, Clone, Serialize)]
pub struct OpsSummary {
    pub status: String,
    pub window_hours: i64,
    pub generated_at: String,
    pub leases: LeaseHealth,
    pub idempotency: IdempotencyHealth,
    pub timeouts: TimeoutHealth,
    pub polling: PollingHealth,
    pub reasons: Vec<String>,
}

fn window_start(window_hours: i64) -> String {
    (Utc::now() - Duration::hours(window_hours.max(1)))
        .to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Compute the health summary.
///
/// `audit_log` is the ingress audit file; when absent, the command/poll
/// counters stay zero (the registry tables alone still drive lease and
/// idempotency health).
pub async fn ops_summary(
    pool: &DbPool,
    window_hours: i64,
    audit_log: Option<&Path>,
) -> Result<OpsSummary> {
    let start = window_start(window_hours);
    let now_dt = Utc::now();

    let lease_rows = sqlx::query("SELECT * FROM task_dispatch_lease")
        .fetch_all(pool)
        .await?;
    let mut queued = 0i64;
    let mut running = 0i64;
    let mut stale = 0i64;
    for row in &lease_rows {
        let lease = row_to_lease(row)?;
        match lease.lease_status {
            LeaseStatus::Queued => queued += 1,
            LeaseStatus::Running => {
                running += 1;
                if lease.is_expired_at(now_dt)? {
                    stale += 1;
                }
            }
            _ => {}
        }
    }

    let conflict_window: i64 = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM idempotency_keys \
         WHERE status = 'conflict' AND updated_at >= ?",
    )
    .bind(&start)
    .fetch_one(pool)
    .await?
    .try_get("cnt")?;

    let dispatch_window: i64 = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM task_events \
         WHERE event_type = 'router' AND detail LIKE 'dispatch_timeout%' AND created_at >= ?",
    )
    .bind(&start)
    .fetch_one(pool)
    .await?
    .try_get("cnt")?;

    let mut command_window = 0i64;
    let mut poll_error_window = 0i64;
    let mut poll_recovered_window = 0i64;
    if let Some(path) = audit_log {
        for row in read_audit_rows(path, &start) {
            match row.get("status").and_then(Value::as_str) {
                Some("command_timeout") => command_window += 1,
                Some("poll_error") => poll_error_window += 1,
                Some("poll_recovered") => poll_recovered_window += 1,
                _ => {}
            }
        }
    }

    let mut reasons = Vec::new();
    if stale > 0 {
        reasons.push("stale_lease_present".to_owned());
    }
    if conflict_window > 0 {
        reasons.push("idempotency_conflicts_detected".to_owned());
    }
    if dispatch_window > 0 {
        reasons.push("dispatch_timeouts_detected".to_owned());
    }
    if command_window > 0 {
        reasons.push("command_timeouts_detected".to_owned());
    }
    if poll_error_window > 0 {
        reasons.push("poll_errors_detected".to_owned());
    }

    let status = if reasons.is_empty() { "healthy" } else { "degraded" };

    Ok(OpsSummary {
        status: status.to_owned(),
        window_hours,
        generated_at: crate::models::utc_now(),
        leases: LeaseHealth {
            queued,
            running,
            stale,
        },
        idempotency: IdempotencyHealth { conflict_window },
        timeouts: TimeoutHealth {
            dispatch_window,
            command_window,
        },
        polling: PollingHealth {
            poll_error_window,
            poll_recovered_window,
        },
        reasons,
    })
}

/// Audit rows whose `ts` falls inside the window. Malformed lines are
/// skipped; the audit file is operator-appended and occasionally truncated.
fn read_audit_rows(path: &Path, start: &str) -> Vec<Value> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .filter(|row| {
            row.get("ts")
                .and_then(Value::as_str)
                .map(|ts| ts >= start)
                .unwrap_or(false)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Aggregated dispatch telemetry over recent tasks.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySummary {
    pub task_count: i64,
    pub avg_dispatch_duration_ms: f64,
    pub p90_dispatch_duration_ms: f64,
    pub total_estimated_tokens: i64,
    pub avg_estimated_tokens: f64,
    pub total_estimated_cost_usd: f64,
    pub avg_estimated_cost_usd: f64,
    pub avg_compression_ratio: f64,
    pub cost_source_counts: BTreeMap<String, i64>,
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Nearest-rank percentile over an unsorted sample.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = (((sorted.len() - 1) as f64) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Aggregate the router's per-task telemetry metadata over the most recent
/// tasks (up to `limit`).
pub async fn telemetry_summary(pool: &DbPool, limit: i64) -> Result<TelemetrySummary> {
    let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;

    let mut dispatch_ms = Vec::new();
    let mut ratios = Vec::new();
    let mut total_tokens = 0i64;
    let mut total_cost = 0.0f64;
    let mut cost_source_counts: BTreeMap<String, i64> = BTreeMap::new();

    for row in &rows {
        let task = row_to_task(row)?;
        let meta = &task.metadata;

        if let Some(ms) = meta.get("dispatch_duration_ms").and_then(Value::as_f64) {
            if ms > 0.0 {
                dispatch_ms.push(ms);
            }
        }
        total_tokens += meta
            .get("estimated_total_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        total_cost += meta
            .get("estimated_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if let Some(ratio) = meta.get("compression_ratio").and_then(Value::as_f64) {
            if ratio > 0.0 {
                ratios.push(ratio);
            }
        }
        if let Some(source) = meta.get("cost_source").and_then(Value::as_str) {
            *cost_source_counts.entry(source.to_owned()).or_insert(0) += 1;
        }
    }

    let task_count = rows.len() as i64;
    let avg = |values: &[f64]| {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    };

    Ok(TelemetrySummary {
        task_count,
        avg_dispatch_duration_ms: round2(avg(&dispatch_ms)),
        p90_dispatch_duration_ms: round2(percentile(&dispatch_ms, 0.90)),
        total_estimated_tokens: total_tokens,
        avg_estimated_tokens: if task_count > 0 {
            round2(total_tokens as f64 / task_count as f64)
        } else {
            0.0
        },
        total_estimated_cost_usd: round6(total_cost),
        avg_estimated_cost_usd: if task_count > 0 {
            round6(total_cost / task_count as f64)
        } else {
            0.0
        },
        avg_compression_ratio: round6(avg(&ratios)),
        cost_source_counts,
    })
}
