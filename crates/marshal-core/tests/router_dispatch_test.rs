//! End-to-end router tests: policy blocks, gate blocking, transient
//! retry, approve-defer-then-resume, and dispatch idempotency.

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use marshal_core::config::{AutonomyMode, CostConfig, PlaneConfig};
use marshal_core::router::Router;
use marshal_db::models::{ApprovalStatus, LeaseStatus, TaskStatus};
use marshal_db::queries::{events, idempotency, leases, tasks};
use marshal_db::{pool, DbConfig};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

struct Harness {
    db: pool::DbPool,
    router: Router,
    _tmp: TempDir,
}

fn plane_config(root: &Path) -> PlaneConfig {
    PlaneConfig {
        storage_root: root.join("storage"),
        routing_policy_path: root.join("policies/routing.toml"),
        approval_policy_path: root.join("policies/approvals.toml"),
        execution_policy_path: root.join("policies/execution.toml"),
        policy_enforcement: None,
        autonomy_mode: AutonomyMode::Supervised,
        runtime_mode: "single_node".to_owned(),
        dispatch_owner: Some("test-owner".to_owned()),
        lease_seconds: 120,
        retry_max: 1,
        retry_backoff_seconds: 0.01,
        retry_jitter_seconds: 0.0,
        dispatch_timeout: Duration::from_secs(5),
        context_token_budget: 400,
        context_token_budget_heavy: 800,
        context_target_ratio: 0.6,
        cost: CostConfig {
            lookup_enabled: false,
            lookup_timeout_ms: 50,
            model_default: "test/model".to_owned(),
            default_provider: "test".to_owned(),
            default_model: "test/model".to_owned(),
            fallback_provider: "test".to_owned(),
            fallback_model: "test/fallback".to_owned(),
            api_key: None,
            api_base: "http://127.0.0.1:9".to_owned(),
        },
        worker_light_cmd: None,
        worker_heavy_cmd: None,
    }
}

fn write_routing_policy(root: &Path) {
    std::fs::create_dir_all(root.join("policies")).unwrap();
    std::fs::write(
        root.join("policies/routing.toml"),
        r#"
[default]
route_class = "LIGHT"
risk_level = "low"

[task_type_overrides.code_refactor]
route_class = "HEAVY"
risk_level = "medium"

[task_type_overrides.deploy]
route_class = "HEAVY"
risk_level = "medium"
"#,
    )
    .unwrap();
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

async fn harness_with(tweak: impl FnOnce(&mut PlaneConfig)) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    write_routing_policy(tmp.path());
    let db = pool::open(&DbConfig::new(tmp.path().join("registry.db")))
        .await
        .expect("open registry");
    let mut config = plane_config(tmp.path());
    tweak(&mut config);
    let router = Router::new(db.clone(), config);
    Harness {
        db,
        router,
        _tmp: tmp,
    }
}

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, body: &str) -> String {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// A worker wrapper that fails with a transient marker on its first run
/// and prints READY afterwards, counting invocations in a side file.
#[cfg(unix)]
fn flaky_worker(dir: &Path) -> (String, std::path::PathBuf) {
    let counter = dir.join("attempts.txt");
    let body = format!(
        "#!/bin/sh\n\
         COUNTER=\"{}\"\n\
         n=0\n\
         [ -f \"$COUNTER\" ] && n=$(cat \"$COUNTER\")\n\
         n=$((n+1))\n\
         printf '%s' \"$n\" > \"$COUNTER\"\n\
         if [ \"$n\" -eq 1 ]; then\n\
           echo 'dispatch timed out simulated' >&2\n\
           exit 1\n\
         fi\n\
         echo READY\n\
         exit 0\n",
        counter.display()
    );
    (write_script(dir, "flaky_worker.sh", &body), counter)
}

#[cfg(unix)]
fn ready_worker(dir: &Path) -> (String, std::path::PathBuf) {
    let counter = dir.join("ready_attempts.txt");
    let body = format!(
        "#!/bin/sh\n\
         COUNTER=\"{}\"\n\
         n=0\n\
         [ -f \"$COUNTER\" ] && n=$(cat \"$COUNTER\")\n\
         n=$((n+1))\n\
         printf '%s' \"$n\" > \"$COUNTER\"\n\
         echo READY\n\
         exit 0\n",
        counter.display()
    );
    (write_script(dir, "ready_worker.sh", &body), counter)
}

fn read_counter(path: &Path) -> u32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn light_route_runs_builtin_stub() {
    let h = harness().await;
    let outcome = h.router.route("ping", "hello there", Some("tg-1")).await.expect("route");
    assert_eq!(outcome.status, TaskStatus::Succeeded);
    assert_eq!(outcome.message, "light_stub_executed");

    let detail = tasks::get_task(&h.db, &outcome.task_id).await.expect("get");
    assert_eq!(detail.task.metadata["trace_id"], "tg-1");
    assert_eq!(detail.task.metadata["cost_source"], "heuristic");
    assert!(detail.task.metadata["dispatch_duration_ms"].is_number());
    let stub_log = h
        .router
        .config()
        .task_dir(&outcome.task_id)
        .join("light_worker_stub.log");
    assert!(stub_log.is_file());

    // The dispatch left a compacted context within budget.
    let compacted = h
        .router
        .config()
        .artifact_dir(&outcome.task_id)
        .join("context_compacted.txt");
    assert!(compacted.is_file());
}

#[tokio::test]
async fn heavy_route_blocks_on_review_gate() {
    let h = harness().await;
    let outcome = h.router.route("code_refactor", "retier the cache", None).await.expect("route");
    assert_eq!(outcome.status, TaskStatus::Blocked);
    assert!(outcome.pending.contains(&"planner_reviewer_gate".to_owned()));

    let task_events = events::list_events(&h.db, &outcome.task_id, 100).await.expect("events");
    assert!(task_events.iter().any(|e| e.detail == "review_gate_pending"));
}

#[tokio::test]
async fn policy_denial_blocks_without_dispatch() {
    let tmp_marker = |h: &Harness| h.router.config().execution_policy_path.clone();
    let h = harness().await;
    std::fs::create_dir_all(tmp_marker(&h).parent().unwrap()).unwrap();
    std::fs::write(
        tmp_marker(&h),
        r#"
enforcement = "strict"
blocked_prompt_keywords = ["rm -rf"]
"#,
    )
    .unwrap();

    let outcome = h
        .router
        .route("ping", "please rm -rf the archive", None)
        .await
        .expect("route");
    assert_eq!(outcome.status, TaskStatus::Blocked);
    assert_eq!(outcome.policy_status, "denied");
    assert_eq!(outcome.policy_reason, "blocked_prompt_keyword");

    let task_events = events::list_events(&h.db, &outcome.task_id, 100).await.expect("events");
    assert!(task_events
        .iter()
        .any(|e| e.detail == "policy_block reason=blocked_prompt_keyword"));
    // No dispatch happened: no lease, no stub log.
    assert!(leases::get_lease(&h.db, &outcome.task_id).await.expect("lease").is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn transient_dispatch_retries_then_succeeds() {
    let tmp = tempfile::tempdir().expect("scripts dir");
    let (script, counter) = flaky_worker(tmp.path());
    let h = harness_with(|config| {
        config.worker_light_cmd = Some(script.clone());
        config.retry_max = 1;
    })
    .await;

    let outcome = h.router.route("ping", "transient retry probe", None).await.expect("route");
    assert_eq!(outcome.status, TaskStatus::Succeeded);
    assert_eq!(read_counter(&counter), 2, "wrapper must be invoked exactly twice");

    let task_events = events::list_events(&h.db, &outcome.task_id, 100).await.expect("events");
    assert!(task_events.iter().any(|e| e.detail.starts_with("dispatch_retry attempt=1")));

    let lease = leases::get_lease(&h.db, &outcome.task_id)
        .await
        .expect("lease")
        .expect("exists");
    assert_eq!(lease.lease_status, LeaseStatus::Succeeded);
    assert_eq!(lease.attempt_count, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn exhausted_transient_retries_fail() {
    let tmp = tempfile::tempdir().expect("scripts dir");
    let script = write_script(
        tmp.path(),
        "always_transient.sh",
        "#!/bin/sh\necho 'connection reset by peer' >&2\nexit 1\n",
    );
    let h = harness_with(|config| {
        config.worker_light_cmd = Some(script.clone());
        config.retry_max = 1;
    })
    .await;

    let outcome = h.router.route("ping", "doomed probe", None).await.expect("route");
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert!(outcome.message.starts_with("dispatch_failed: retries_exhausted"));
}

#[cfg(unix)]
#[tokio::test]
async fn non_transient_failure_does_not_retry() {
    let tmp = tempfile::tempdir().expect("scripts dir");
    let counter = tmp.path().join("count.txt");
    let body = format!(
        "#!/bin/sh\nn=0\n[ -f \"{0}\" ] && n=$(cat \"{0}\")\nn=$((n+1))\nprintf '%s' \"$n\" > \"{0}\"\necho 'segfault' >&2\nexit 2\n",
        counter.display()
    );
    let script = write_script(tmp.path(), "hard_fail.sh", &body);
    let h = harness_with(|config| {
        config.worker_light_cmd = Some(script.clone());
        config.retry_max = 3;
    })
    .await;

    let outcome = h.router.route("ping", "hard failure probe", None).await.expect("route");
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(read_counter(&counter), 1, "non-transient failures must not retry");
}

#[cfg(unix)]
#[tokio::test]
async fn approve_defer_then_resume_dispatches_once() {
    let tmp = tempfile::tempdir().expect("scripts dir");
    let (script, counter) = ready_worker(tmp.path());
    let h = harness_with(|config| {
        config.worker_heavy_cmd = Some(script.clone());
    })
    .await;

    // The approval policy demands a human for deploy tasks.
    std::fs::write(
        h.router.config().approval_policy_path.clone(),
        "[gates.deploy_restart]\nrequire_human_approval = true\n",
    )
    .unwrap();

    let outcome = h.router.route("deploy", "roll the frontend", None).await.expect("route");
    let task_id = outcome.task_id.clone();
    assert_eq!(outcome.status, TaskStatus::Blocked);
    assert!(outcome.pending.contains(&"planner_reviewer_gate".to_owned()));
    assert!(outcome.pending.contains(&"human_approval".to_owned()));

    h.router
        .record_plan(&task_id, "@planner", "stage, verify, flip traffic")
        .await
        .expect("record plan");
    let checklist = json!({
        "policy_safety": true,
        "correctness": true,
        "tests": true,
        "rollback": true,
        "approval_constraints": true
    });
    h.router
        .record_review(&task_id, "@reviewer", "pass", "", &checklist, "lgtm")
        .await
        .expect("record review");

    // Approve with deferred dispatch: record only.
    let approved = h
        .router
        .approve(&task_id, "deploy_restart", "@operator", "ok", ApprovalStatus::Approved, true)
        .await
        .expect("approve");
    assert_eq!(approved.status, TaskStatus::Blocked);
    assert!(approved.message.contains("Approval recorded"));
    assert_eq!(read_counter(&counter), 0, "deferred approval must not dispatch");

    let task_events = events::list_events(&h.db, &task_id, 200).await.expect("events");
    assert!(!task_events.iter().any(|e| e.detail.starts_with("dispatch_succeeded")));

    // Resume dispatches exactly once.
    let resumed = h.router.resume(&task_id, "@operator").await.expect("resume");
    assert_eq!(resumed.status, TaskStatus::Succeeded);
    assert_eq!(read_counter(&counter), 1);

    // Resume on a terminal task is a no-op.
    let again = h.router.resume(&task_id, "@operator").await.expect("resume again");
    assert_eq!(again.status, TaskStatus::Succeeded);
    assert!(again.message.contains("already terminal"));
    assert_eq!(read_counter(&counter), 1, "no second dispatch");
}

#[tokio::test]
async fn record_plan_rejects_light_tasks() {
    let h = harness().await;
    let outcome = h.router.route("ping", "light task", None).await.expect("route");
    let err = h
        .router
        .record_plan(&outcome.task_id, "@planner", "plan")
        .await
        .expect_err("light tasks have no planner gate");
    assert!(err.to_string().contains("HEAVY"));
}

#[tokio::test]
async fn record_review_validates_inputs() {
    let h = harness().await;
    let outcome = h.router.route("code_refactor", "needs review", None).await.expect("route");
    let task_id = outcome.task_id;

    let good_checklist = json!({
        "policy_safety": true,
        "correctness": true,
        "tests": true,
        "rollback": true,
        "approval_constraints": true
    });

    // Unknown verdict.
    assert!(h
        .router
        .record_review(&task_id, "@r", "maybe", "", &good_checklist, "")
        .await
        .is_err());

    // Fail without a reason code.
    assert!(h
        .router
        .record_review(&task_id, "@r", "fail", "", &good_checklist, "")
        .await
        .is_err());

    // Pass with a false checklist item.
    let bad_checklist = json!({
        "policy_safety": true,
        "correctness": true,
        "tests": false,
        "rollback": true,
        "approval_constraints": true
    });
    assert!(h
        .router
        .record_review(&task_id, "@r", "pass", "", &bad_checklist, "")
        .await
        .is_err());

    // A proper fail review records its reason, and a later pass overrides.
    h.router
        .record_review(&task_id, "@r", "fail", "missing_tests", &good_checklist, "add tests")
        .await
        .expect("fail review");
    h.router
        .record_review(&task_id, "@r", "pass", "", &good_checklist, "fixed")
        .await
        .expect("pass review override");

    let task_events = events::list_events(&h.db, &task_id, 200).await.expect("events");
    let reviews: Vec<_> = task_events
        .iter()
        .filter(|e| e.detail.starts_with("reviewer_artifact_recorded"))
        .collect();
    assert_eq!(reviews.len(), 2, "the event log keeps both reviews");
}

#[tokio::test]
async fn lease_held_by_other_owner_returns_pending() {
    let h = harness().await;
    // Block dispatch on approval so route leaves the task blocked.
    let outcome = h.router.route("code_refactor", "held lease probe", None).await.expect("route");
    let task_id = outcome.task_id.clone();

    // Another owner claims the lease out-of-band.
    leases::enqueue_dispatch_lease(&h.db, &task_id, "rival-owner", 300)
        .await
        .expect("enqueue");
    leases::claim_dispatch_lease(&h.db, &task_id, "rival-owner", 300)
        .await
        .expect("claim");

    // Open the gate so the lease is the only obstacle.
    h.router
        .record_plan(&task_id, "@planner", "plan")
        .await
        .expect("plan");
    let checklist = json!({
        "policy_safety": true,
        "correctness": true,
        "tests": true,
        "rollback": true,
        "approval_constraints": true
    });
    h.router
        .record_review(&task_id, "@reviewer", "pass", "", &checklist, "")
        .await
        .expect("review");

    let resumed = h.router.resume(&task_id, "@operator").await.expect("resume");
    assert!(resumed.pending.contains(&"lease_held_by_other_owner".to_owned()));
    assert_eq!(resumed.status, TaskStatus::Running);
}

#[cfg(unix)]
#[tokio::test]
async fn completed_dispatch_attempt_replays_from_idempotency() {
    let tmp = tempfile::tempdir().expect("scripts dir");
    let (script, counter) = ready_worker(tmp.path());
    let h = harness_with(|config| {
        config.worker_light_cmd = Some(script.clone());
    })
    .await;

    let outcome = h.router.route("ping", "idempotent dispatch", None).await.expect("route");
    let task_id = outcome.task_id.clone();
    assert_eq!(read_counter(&counter), 1);

    let record = idempotency::get_idempotency(&h.db, &format!("dispatch:{task_id}:1"))
        .await
        .expect("idempotency record");
    assert_eq!(
        record.result.as_ref().unwrap()["dispatch_status"],
        "succeeded"
    );

    // Simulate a crash after the idempotency record was finalized but
    // before the lease and task reached their terminal state: the task is
    // rewound and the lease is still running for the same owner with the
    // same attempt_count. A resume then replays the stored outcome
    // instead of re-running the worker.
    tasks::update_task(&h.db, &task_id, TaskStatus::Blocked, "operator rewind", true)
        .await
        .expect("force rewind");
    sqlx::query(
        "UPDATE task_dispatch_lease SET lease_status = 'running', \
         lease_expires_at = '2100-01-01T00:00:00+00:00' WHERE task_id = ?",
    )
    .bind(&task_id)
    .execute(&h.db)
    .await
    .expect("revive lease");

    let resumed = h.router.resume(&task_id, "@operator").await.expect("resume");
    assert!(resumed.pending.contains(&"idempotent_replay".to_owned()));
    assert_eq!(resumed.status, TaskStatus::Succeeded);
    assert_eq!(read_counter(&counter), 1, "the worker must not run again");
}

#[tokio::test]
async fn classify_only_has_no_side_effects() {
    let h = harness().await;
    let classified = h.router.classify_only("code_refactor", "prompt").expect("classify");
    assert_eq!(classified.route_class.to_string(), "HEAVY");
    let list = tasks::list_tasks(&h.db, 10).await.expect("list");
    assert!(list.is_empty());
}
