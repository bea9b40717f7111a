//! Integration tests for approval rows: single active row per category,
//! idempotent re-decision, conflicting re-decision rejection.

use serde_json::json;
use tempfile::TempDir;

use marshal_db::models::{ApprovalStatus, RiskLevel, RouteClass, TaskStatus};
use marshal_db::queries::{approvals, tasks};
use marshal_db::{pool, DbConfig, RegistryError};

const CATEGORY: &str = "supervised_heavy_execution";

async fn setup_with_task(task_id: &str) -> (pool::DbPool, TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = DbConfig::new(tmp.path().join("registry.db"));
    let db = pool::open(&config).await.expect("open registry");
    tasks::create_task(
        &db,
        &tasks::NewTask {
            task_id: task_id.to_owned(),
            task_type: "deploy".to_owned(),
            prompt: "approval test".to_owned(),
            route_class: RouteClass::Heavy,
            status: TaskStatus::Blocked,
            requires_approval: true,
            risk_level: RiskLevel::High,
            assigned_worker: None,
            metadata: json!({}),
        },
    )
    .await
    .expect("create task");
    (db, tmp)
}

#[tokio::test]
async fn request_creates_then_refreshes_single_row() {
    let (db, _tmp) = setup_with_task("task-appr-1").await;

    let first = approvals::request_approval(&db, "task-appr-1", CATEGORY, "operator-a", "need it")
        .await
        .expect("first request");
    assert_eq!(first.status, ApprovalStatus::Required);

    let second = approvals::request_approval(&db, "task-appr-1", CATEGORY, "operator-b", "ping")
        .await
        .expect("second request");
    // Refresh, not duplicate.
    assert_eq!(second.id, first.id);
    assert_eq!(second.requested_by, "operator-b");

    let all = approvals::list_approvals(&db, "task-appr-1").await.expect("list");
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn request_on_terminal_approval_is_noop() {
    let (db, _tmp) = setup_with_task("task-appr-2").await;
    approvals::request_approval(&db, "task-appr-2", CATEGORY, "op", "")
        .await
        .expect("request");
    approvals::decide_approval(&db, "task-appr-2", CATEGORY, ApprovalStatus::Rejected, "op", "no")
        .await
        .expect("reject");

    let after = approvals::request_approval(&db, "task-appr-2", CATEGORY, "op", "again")
        .await
        .expect("request after terminal");
    assert_eq!(after.status, ApprovalStatus::Rejected);

    let all = approvals::list_approvals(&db, "task-appr-2").await.expect("list");
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn same_outcome_redecision_is_idempotent() {
    let (db, _tmp) = setup_with_task("task-appr-3").await;
    approvals::request_approval(&db, "task-appr-3", CATEGORY, "op", "")
        .await
        .expect("request");

    let first =
        approvals::decide_approval(&db, "task-appr-3", CATEGORY, ApprovalStatus::Approved, "op", "ok")
            .await
            .expect("approve");
    let second =
        approvals::decide_approval(&db, "task-appr-3", CATEGORY, ApprovalStatus::Approved, "op", "ok")
            .await
            .expect("re-approve is a no-op");
    assert_eq!(first.id, second.id);
    assert_eq!(second.status, ApprovalStatus::Approved);
    assert_eq!(second.updated_at, first.updated_at);
}

#[tokio::test]
async fn conflicting_redecision_fails() {
    let (db, _tmp) = setup_with_task("task-appr-4").await;
    approvals::request_approval(&db, "task-appr-4", CATEGORY, "op", "")
        .await
        .expect("request");
    approvals::decide_approval(&db, "task-appr-4", CATEGORY, ApprovalStatus::Approved, "op", "")
        .await
        .expect("approve");

    let err =
        approvals::decide_approval(&db, "task-appr-4", CATEGORY, ApprovalStatus::Rejected, "op", "")
            .await
            .expect_err("flip must fail");
    assert!(matches!(err, RegistryError::IntegrityConflict(_)));
}

#[tokio::test]
async fn decide_requires_a_decision_status() {
    let (db, _tmp) = setup_with_task("task-appr-5").await;
    approvals::request_approval(&db, "task-appr-5", CATEGORY, "op", "")
        .await
        .expect("request");

    let err =
        approvals::decide_approval(&db, "task-appr-5", CATEGORY, ApprovalStatus::Required, "op", "")
            .await
            .expect_err("required is not a decision");
    assert!(matches!(err, RegistryError::InvalidArgument(_)));
}

#[tokio::test]
async fn decide_without_request_is_not_found() {
    let (db, _tmp) = setup_with_task("task-appr-6").await;
    let err =
        approvals::decide_approval(&db, "task-appr-6", CATEGORY, ApprovalStatus::Approved, "op", "")
            .await
            .expect_err("no approval row yet");
    assert!(matches!(err, RegistryError::NotFound(_)));
}

#[tokio::test]
async fn categories_are_independent() {
    let (db, _tmp) = setup_with_task("task-appr-7").await;
    approvals::request_approval(&db, "task-appr-7", "deploy_restart", "op", "")
        .await
        .expect("request deploy");
    approvals::request_approval(&db, "task-appr-7", "delete_files", "op", "")
        .await
        .expect("request delete");

    approvals::decide_approval(
        &db,
        "task-appr-7",
        "deploy_restart",
        ApprovalStatus::Approved,
        "op",
        "",
    )
    .await
    .expect("approve deploy");

    let delete = approvals::latest_approval(&db, "task-appr-7", "delete_files")
        .await
        .expect("latest")
        .expect("exists");
    assert_eq!(delete.status, ApprovalStatus::Required);
}
