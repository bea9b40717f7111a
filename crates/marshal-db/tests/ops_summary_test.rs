//! Integration tests for the ops health summary and telemetry aggregation.

use serde_json::json;
use tempfile::TempDir;

use marshal_db::models::{utc_now, IdempotencyScope, RiskLevel, RouteClass, TaskStatus};
use marshal_db::queries::{idempotency, leases, ops, tasks};
use marshal_db::{pool, DbConfig};

async fn setup() -> (pool::DbPool, TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = DbConfig::new(tmp.path().join("registry.db"));
    let db = pool::open(&config).await.expect("open registry");
    (db, tmp)
}

async fn create_task(db: &pool::DbPool, task_id: &str, status: TaskStatus, metadata: serde_json::Value) {
    tasks::create_task(
        db,
        &tasks::NewTask {
            task_id: task_id.to_owned(),
            task_type: "code_refactor".to_owned(),
            prompt: "ops summary test".to_owned(),
            route_class: RouteClass::Heavy,
            status,
            requires_approval: true,
            risk_level: RiskLevel::Medium,
            assigned_worker: None,
            metadata,
        },
    )
    .await
    .expect("create task");
}

#[tokio::test]
async fn healthy_baseline() {
    let (db, _tmp) = setup().await;
    create_task(&db, "task-ops-healthy", TaskStatus::Blocked, json!({})).await;

    let summary = ops::ops_summary(&db, 24, None).await.expect("summary");
    assert_eq!(summary.status, "healthy");
    assert_eq!(summary.leases.stale, 0);
    assert_eq!(summary.idempotency.conflict_window, 0);
    assert!(summary.reasons.is_empty());
}

#[tokio::test]
async fn degraded_on_stale_lease() {
    let (db, _tmp) = setup().await;
    create_task(&db, "task-ops-stale", TaskStatus::Running, json!({})).await;
    leases::enqueue_dispatch_lease(&db, "task-ops-stale", "owner-a", 120)
        .await
        .expect("enqueue");
    leases::claim_dispatch_lease(&db, "task-ops-stale", "owner-a", 120)
        .await
        .expect("claim");

    // Force the expiry into the past, as if the owner died mid-run.
    sqlx::query("UPDATE task_dispatch_lease SET lease_expires_at = '2000-01-01T00:00:00+00:00' WHERE task_id = ?")
        .bind("task-ops-stale")
        .execute(&db)
        .await
        .expect("backdate lease");

    let summary = ops::ops_summary(&db, 24, None).await.expect("summary");
    assert_eq!(summary.status, "degraded");
    assert!(summary.leases.stale > 0);
    assert!(summary.reasons.contains(&"stale_lease_present".to_owned()));
}

#[tokio::test]
async fn degraded_on_idempotency_conflict() {
    let (db, _tmp) = setup().await;
    idempotency::begin_idempotency(&db, "tg_update:9001", IdempotencyScope::TelegramCommand, "hash-a", None)
        .await
        .expect("begin");
    idempotency::begin_idempotency(&db, "tg_update:9001", IdempotencyScope::TelegramCommand, "hash-b", None)
        .await
        .expect("conflicting begin");

    let summary = ops::ops_summary(&db, 24, None).await.expect("summary");
    assert_eq!(summary.status, "degraded");
    assert!(summary.idempotency.conflict_window > 0);
    assert!(summary
        .reasons
        .contains(&"idempotency_conflicts_detected".to_owned()));
}

#[tokio::test]
async fn degraded_on_timeout_signals() {
    let (db, tmp) = setup().await;
    create_task(&db, "task-ops-timeout", TaskStatus::Failed, json!({})).await;
    tasks::append_router_event(&db, "task-ops-timeout", "dispatch_timeout after 900s")
        .await
        .expect("router event");

    let audit_path = tmp.path().join("audit.jsonl");
    std::fs::write(
        &audit_path,
        format!("{}\n", json!({"ts": utc_now(), "status": "command_timeout"})),
    )
    .expect("write audit");

    let summary = ops::ops_summary(&db, 24, Some(&audit_path)).await.expect("summary");
    assert_eq!(summary.status, "degraded");
    assert!(summary.timeouts.dispatch_window > 0);
    assert!(summary.timeouts.command_window > 0);
    assert!(summary.reasons.contains(&"dispatch_timeouts_detected".to_owned()));
    assert!(summary.reasons.contains(&"command_timeouts_detected".to_owned()));
}

#[tokio::test]
async fn poll_incidents_are_counted() {
    let (db, tmp) = setup().await;
    let audit_path = tmp.path().join("audit.jsonl");
    let lines = [
        json!({"ts": utc_now(), "status": "poll_error", "error_count": 1}),
        json!({"ts": utc_now(), "status": "poll_recovered"}),
    ];
    let content: String = lines.iter().map(|l| format!("{l}\n")).collect();
    std::fs::write(&audit_path, content).expect("write audit");

    let summary = ops::ops_summary(&db, 24, Some(&audit_path)).await.expect("summary");
    assert_eq!(summary.polling.poll_error_window, 1);
    assert_eq!(summary.polling.poll_recovered_window, 1);
    assert!(summary.reasons.contains(&"poll_errors_detected".to_owned()));
}

#[tokio::test]
async fn old_audit_rows_fall_outside_the_window() {
    let (db, tmp) = setup().await;
    let audit_path = tmp.path().join("audit.jsonl");
    std::fs::write(
        &audit_path,
        format!(
            "{}\n",
            json!({"ts": "2000-01-01T00:00:00+00:00", "status": "command_timeout"})
        ),
    )
    .expect("write audit");

    let summary = ops::ops_summary(&db, 24, Some(&audit_path)).await.expect("summary");
    assert_eq!(summary.timeouts.command_window, 0);
    assert_eq!(summary.status, "healthy");
}

#[tokio::test]
async fn telemetry_aggregates_metadata_fields() {
    let (db, _tmp) = setup().await;
    create_task(
        &db,
        "task-tel-1",
        TaskStatus::Succeeded,
        json!({
            "dispatch_duration_ms": 100.0,
            "estimated_total_tokens": 1200,
            "estimated_cost_usd": 0.0042,
            "compression_ratio": 0.5,
            "cost_source": "heuristic"
        }),
    )
    .await;
    create_task(
        &db,
        "task-tel-2",
        TaskStatus::Succeeded,
        json!({
            "dispatch_duration_ms": 300.0,
            "estimated_total_tokens": 800,
            "estimated_cost_usd": 0.0008,
            "compression_ratio": 0.7,
            "cost_source": "openrouter_api"
        }),
    )
    .await;

    let summary = ops::telemetry_summary(&db, 500).await.expect("telemetry");
    assert_eq!(summary.task_count, 2);
    assert_eq!(summary.avg_dispatch_duration_ms, 200.0);
    assert_eq!(summary.total_estimated_tokens, 2000);
    assert_eq!(summary.total_estimated_cost_usd, 0.005);
    assert_eq!(summary.avg_compression_ratio, 0.6);
    assert_eq!(summary.cost_source_counts.get("heuristic"), Some(&1));
    assert_eq!(summary.cost_source_counts.get("openrouter_api"), Some(&1));
}
