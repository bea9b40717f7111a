//! Ingress pipeline tests: duplicate update replay, allowlist, rate
//! limiting, non-command chatter, and poll-loop incident bookkeeping.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use marshal_core::config::{AutonomyMode, CostConfig, PlaneConfig};
use marshal_core::error::{CoreError, Result as CoreResult};
use marshal_core::ingress::transport::{ChatTransport, Update};
use marshal_core::ingress::{Ingress, IngressConfig};
use marshal_core::router::Router;
use marshal_db::{pool, DbConfig};

/// Transport fake: scripted fetch results plus a record of sent replies.
#[derive(Clone, Default)]
struct FakeTransport {
    fetches: Arc<Mutex<VecDeque<CoreResult<Vec<Update>>>>>,
    sent: Arc<Mutex<Vec<(i64, String)>>>,
    drained: Arc<Mutex<Option<CancellationToken>>>,
}

impl FakeTransport {
    fn sent_messages(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    fn push_fetch(&self, result: CoreResult<Vec<Update>>) {
        self.fetches.lock().unwrap().push_back(result);
    }

    /// Cancel this token once every scripted fetch has been consumed.
    fn cancel_when_drained(&self, token: CancellationToken) {
        *self.drained.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn fetch_updates(&self, _offset: i64, _timeout_seconds: u64) -> CoreResult<Vec<Update>> {
        let next = self.fetches.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                if let Some(token) = self.drained.lock().unwrap().as_ref() {
                    token.cancel();
                }
                Ok(Vec::new())
            }
        }
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> CoreResult<()> {
        self.sent.lock().unwrap().push((chat_id, text.to_owned()));
        Ok(())
    }
}

fn update(update_id: i64, chat_id: i64, text: &str) -> Update {
    serde_json::from_value(json!({
        "update_id": update_id,
        "message": {
            "chat": {"id": chat_id},
            "from": {"id": chat_id, "username": "operator"},
            "text": text,
        }
    }))
    .expect("update shape")
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
        dispatch_owner: Some("ingress-test".to_owned()),
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

fn ingress_config(root: &Path, allowed: &[i64]) -> IngressConfig {
    let memory = root.join("storage/memory");
    IngressConfig {
        poll_timeout_seconds: 1,
        poll_interval: Duration::from_millis(10),
        command_timeout: Duration::from_secs(5),
        resume_timeout: Duration::from_secs(5),
        allowed_chat_ids: allowed.iter().copied().collect::<BTreeSet<i64>>(),
        require_allowlist: true,
        rate_limit_per_minute: 20,
        rate_limit_burst: 5,
        max_backoff: Duration::from_millis(100),
        audit_log: memory.join("telegram_command_audit.jsonl"),
        offset_file: memory.join("telegram_offset.txt"),
        lock_file: memory.join("telegram_longpoll.lock"),
    }
}

async fn harness(allowed: &[i64]) -> (Ingress<FakeTransport>, FakeTransport, TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = pool::open(&DbConfig::new(tmp.path().join("registry.db")))
        .await
        .expect("open registry");
    let router = Router::new(db.clone(), plane_config(tmp.path()));
    let transport = FakeTransport::default();
    let config = ingress_config(tmp.path(), allowed);
    let ingress = Ingress::new(db, router, config, transport.clone());
    (ingress, transport, tmp)
}

fn audit_rows(path: &Path) -> Vec<Value> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("audit line"))
        .collect()
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_update_executes_once_and_replays() {
    let (mut ingress, transport, tmp) = harness(&[12345]).await;
    let u = update(777, 12345, "/start");

    let first = ingress.process_update(&u).await.expect("first").expect("record");
    assert_eq!(first.status, "ok");

    let second = ingress.process_update(&u).await.expect("second").expect("record");
    assert_eq!(second.status, "idempotent_replay");

    // Exactly one reply was sent for the two deliveries.
    assert_eq!(transport.sent_messages().len(), 1);

    let rows = audit_rows(&tmp.path().join("storage/memory/telegram_command_audit.jsonl"));
    let statuses: Vec<&str> = rows
        .iter()
        .filter(|r| r.get("update_id").and_then(Value::as_i64) == Some(777))
        .map(|r| r["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["ok", "idempotent_replay"]);
}

#[tokio::test]
async fn newtask_command_creates_exactly_one_task_across_replays() {
    let (mut ingress, _transport, tmp) = harness(&[12345]).await;
    let u = update(778, 12345, "/newtask ping duplicate replay probe");

    ingress.process_update(&u).await.expect("first");
    ingress.process_update(&u).await.expect("second");

    let db = pool::open(&DbConfig::new(tmp.path().join("registry.db")))
        .await
        .expect("reopen");
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE metadata_json LIKE '%\"trace_id\":\"tg-778\"%'",
    )
    .fetch_one(&db)
    .await
    .expect("count");
    assert_eq!(count, 1, "one update, one task, regardless of deliveries");
}

#[tokio::test]
async fn unauthorized_chat_is_audited_and_told() {
    let (mut ingress, transport, _tmp) = harness(&[12345]).await;
    let u = update(800, 999, "/start");

    let record = ingress.process_update(&u).await.expect("process").expect("record");
    assert_eq!(record.status, "unauthorized");

    let sent = transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("Unauthorized"));
}

#[tokio::test]
async fn rate_limit_allows_nth_and_rejects_nth_plus_one() {
    let (ingress, transport, tmp) = harness(&[12345]).await;
    // Tighten the limiter: 3 per minute, burst cap off.
    let config = ingress_config(tmp.path(), &[12345]);
    let db = pool::open(&DbConfig::new(tmp.path().join("registry2.db")))
        .await
        .expect("open");
    let router = Router::new(db.clone(), plane_config(tmp.path()));
    let mut ingress2 = Ingress::new(
        db,
        router,
        IngressConfig {
            rate_limit_per_minute: 3,
            rate_limit_burst: 0,
            ..config
        },
        transport.clone(),
    );
    drop(ingress);

    let mut statuses = Vec::new();
    for i in 0..4 {
        let u = update(900 + i, 12345, "/help");
        let record = ingress2.process_update(&u).await.expect("process").expect("record");
        statuses.push(record.status);
    }
    assert_eq!(statuses, vec!["ok", "ok", "ok", "rate_limited"]);
}

#[tokio::test]
async fn non_command_text_is_ignored_without_reply() {
    let (mut ingress, transport, _tmp) = harness(&[12345]).await;
    let u = update(810, 12345, "good morning bot");

    let record = ingress.process_update(&u).await.expect("process").expect("record");
    assert_eq!(record.status, "ignored_non_command");
    assert!(transport.sent_messages().is_empty());
}

#[tokio::test]
async fn command_errors_are_audited_and_replied() {
    let (mut ingress, transport, _tmp) = harness(&[12345]).await;
    let u = update(820, 12345, "/status task-that-does-not-exist");

    let record = ingress.process_update(&u).await.expect("process").expect("record");
    assert_eq!(record.status, "error");
    assert!(record.error.as_deref().unwrap_or("").contains("not found"));

    let sent = transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.starts_with("Error:"));
}

#[tokio::test]
async fn unknown_command_is_an_error_with_usage_hint() {
    let (mut ingress, transport, _tmp) = harness(&[12345]).await;
    let u = update(830, 12345, "/selfdestruct now");

    let record = ingress.process_update(&u).await.expect("process").expect("record");
    assert_eq!(record.status, "error");
    assert!(transport.sent_messages()[0].1.contains("Unknown command"));
}

#[tokio::test]
async fn poll_loop_records_error_and_recovery_and_advances_offset() {
    let (ingress, transport, tmp) = harness(&[12345]).await;

    transport.push_fetch(Err(CoreError::Transport("getUpdates: connection reset".to_owned())));
    transport.push_fetch(Ok(vec![update(850, 12345, "/help")]));

    let cancel = CancellationToken::new();
    transport.cancel_when_drained(cancel.clone());

    tokio::time::timeout(Duration::from_secs(10), ingress.run(cancel))
        .await
        .expect("loop must terminate")
        .expect("loop exits cleanly");

    let rows = audit_rows(&tmp.path().join("storage/memory/telegram_command_audit.jsonl"));
    let statuses: Vec<&str> = rows.iter().map(|r| r["status"].as_str().unwrap()).collect();
    assert!(statuses.contains(&"startup"));
    assert!(statuses.contains(&"poll_error"));
    assert!(statuses.contains(&"poll_recovered"));
    assert!(statuses.contains(&"ok"));

    let offset_raw =
        std::fs::read_to_string(tmp.path().join("storage/memory/telegram_offset.txt")).unwrap();
    assert_eq!(offset_raw.trim(), "851");

    // The lock is released on exit.
    assert!(!tmp.path().join("storage/memory/telegram_longpoll.lock").exists());
}

#[tokio::test]
async fn second_ingress_refuses_to_start_while_lock_held() {
    let (ingress, _transport, tmp) = harness(&[12345]).await;
    let lock_path = tmp.path().join("storage/memory/telegram_longpoll.lock");
    std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    std::fs::write(&lock_path, "12345").unwrap();

    let err = ingress
        .run(CancellationToken::new())
        .await
        .expect_err("must refuse while lock exists");
    assert!(err.to_string().contains("lock_exists"));
}
