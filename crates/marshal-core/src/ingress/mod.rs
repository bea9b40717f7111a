//! Long-poll ingress: deduplicated command intake with allowlist
//! enforcement, per-chat rate limiting, exactly-once handler invocation,
//! and incident/recovery bookkeeping.
//!
//! A single ingress loop runs per node, guarded by a lock file. Every
//! observed update yields exactly one audit line and at most one reply.

pub mod audit;
pub mod commands;
pub mod rate_limit;
pub mod transport;

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use marshal_db::models::{IdempotencyScope, IdempotencyStatus};
use marshal_db::pool::DbPool;
use marshal_db::queries::idempotency;

use crate::error::{CoreError, Result};
use crate::router::Router;

pub use audit::{AuditLog, AuditRecord};
pub use rate_limit::RateLimiter;
pub use transport::{ChatTransport, TelegramTransport, Update};

/// Ingress configuration, read from `TELEGRAM_*` variables with file
/// locations under the storage root's memory directory.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub poll_timeout_seconds: u64,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub resume_timeout: Duration,
    pub allowed_chat_ids: BTreeSet<i64>,
    pub require_allowlist: bool,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    pub max_backoff: Duration,
    pub audit_log: PathBuf,
    pub offset_file: PathBuf,
    pub lock_file: PathBuf,
}

fn parse_allowed_chat_ids(raw: &str) -> BTreeSet<i64> {
    raw.split(',')
        .filter_map(|chunk| chunk.trim().parse().ok())
        .collect()
}

impl IngressConfig {
    /// Build from the environment. Fails when the allowlist is required
    /// (the default) but empty.
    pub fn from_env(storage_root: &Path) -> Result<Self> {
        let memory_dir = storage_root.join("memory");

        let require_allowlist = std::env::var("TELEGRAM_REQUIRE_ALLOWLIST")
            .map(|v| v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let allowed_chat_ids = std::env::var("TELEGRAM_ALLOWED_CHAT_IDS")
            .map(|raw| parse_allowed_chat_ids(&raw))
            .unwrap_or_default();
        if require_allowlist && allowed_chat_ids.is_empty() {
            return Err(CoreError::InvalidArgument(
                "TELEGRAM_ALLOWED_CHAT_IDS is required when TELEGRAM_REQUIRE_ALLOWLIST=1".to_owned(),
            ));
        }

        let env_u64 = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let env_f64 = |key: &str, default: f64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let command_timeout_seconds = env_u64("TELEGRAM_COMMAND_TIMEOUT_SECONDS", 45);
        let resume_timeout_seconds =
            env_u64("TELEGRAM_RESUME_TIMEOUT_SECONDS", 600).max(command_timeout_seconds);

        Ok(Self {
            poll_timeout_seconds: env_u64("TELEGRAM_POLL_TIMEOUT_SECONDS", 30),
            poll_interval: Duration::from_secs_f64(
                env_f64("TELEGRAM_POLL_INTERVAL_SECONDS", 1.0).max(0.2),
            ),
            command_timeout: Duration::from_secs(command_timeout_seconds),
            resume_timeout: Duration::from_secs(resume_timeout_seconds),
            allowed_chat_ids,
            require_allowlist,
            rate_limit_per_minute: env_u64("TELEGRAM_RATE_LIMIT_PER_MINUTE", 20) as u32,
            rate_limit_burst: env_u64("TELEGRAM_RATE_LIMIT_BURST", 5) as u32,
            max_backoff: Duration::from_secs_f64(env_f64("TELEGRAM_MAX_BACKOFF_SECONDS", 60.0).max(1.0)),
            audit_log: memory_dir.join("telegram_command_audit.jsonl"),
            offset_file: memory_dir.join("telegram_offset.txt"),
            lock_file: memory_dir.join("telegram_longpoll.lock"),
        })
    }

    fn chat_allowed(&self, chat_id: i64) -> bool {
        if self.allowed_chat_ids.is_empty() {
            // Allowlist enforcement with an empty list is rejected at
            // config time; an empty list here means enforcement is off.
            return true;
        }
        self.allowed_chat_ids.contains(&chat_id)
    }
}

// ---------------------------------------------------------------------------
// Lock and offset files
// ---------------------------------------------------------------------------

/// Process-wide ingress lock. Creation fails if the file exists; the file
/// is removed on drop so a clean shutdown releases the slot.
#[derive(Debug)]
pub struct IngressLock {
    path: PathBuf,
}

impl IngressLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    CoreError::InvalidArgument(format!("lock_exists: {}", path.display()))
                } else {
                    CoreError::Io(e)
                }
            })?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for IngressLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read the persisted offset cursor; missing or malformed files read as 0.
pub fn read_offset(path: &Path) -> i64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

/// Replace the offset file atomically (write-then-rename).
pub fn write_offset(path: &Path, offset: i64) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, offset.to_string())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn idempotency_payload_hash(update_id: i64, chat_id: i64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(update_id.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(chat_id.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

/// The single-writer ingress loop.
pub struct Ingress<T: ChatTransport> {
    db: DbPool,
    router: Router,
    config: IngressConfig,
    transport: T,
    rate: RateLimiter,
    audit: AuditLog,
}

impl<T: ChatTransport> Ingress<T> {
    pub fn new(db: DbPool, router: Router, config: IngressConfig, transport: T) -> Self {
        let rate = RateLimiter::new(config.rate_limit_per_minute, config.rate_limit_burst);
        let audit = AuditLog::new(config.audit_log.clone());
        Self {
            db,
            router,
            config,
            transport,
            rate,
            audit,
        }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Process one update through the full pipeline: allowlist, rate
    /// limit, idempotency, parse, handle with timeout, audit, offset is
    /// advanced by the caller, reply best-effort.
    ///
    /// Returns the audit record written, or `None` for updates without a
    /// message body.
    pub async fn process_update(&mut self, update: &Update) -> Result<Option<AuditRecord>> {
        let Some(message) = update.message() else {
            return Ok(None);
        };
        let chat_id = message.chat.id;
        let text = message.text.clone().unwrap_or_default();
        let actor = message.actor();
        let trace_id = format!("tg-{}", update.update_id);

        let mut record = AuditRecord::for_update(update.update_id, chat_id, actor.clone(), text.clone());

        // Allowlist.
        if self.config.require_allowlist && !self.config.chat_allowed(chat_id) {
            record.status = "unauthorized".to_owned();
            self.audit.append(&record)?;
            self.reply_best_effort(chat_id, "Unauthorized chat_id for this bot").await;
            return Ok(Some(record));
        }

        // Rate limit.
        if !self.rate.allow(chat_id, unix_now()) {
            record.status = "rate_limited".to_owned();
            self.audit.append(&record)?;
            return Ok(Some(record));
        }

        // Idempotency.
        let key = format!("tg_update:{}", update.update_id);
        let hash = idempotency_payload_hash(update.update_id, chat_id, &text);
        let begin = idempotency::begin_idempotency(
            &self.db,
            &key,
            IdempotencyScope::TelegramCommand,
            &hash,
            None,
        )
        .await?;
        if begin.exists {
            record.status = if begin.conflict {
                "idempotency_conflict".to_owned()
            } else {
                "idempotent_replay".to_owned()
            };
            record.result = begin.result;
            self.audit.append(&record)?;
            return Ok(Some(record));
        }

        // Non-command chatter is acknowledged in the audit log only.
        if !text.starts_with('/') {
            record.status = "ignored_non_command".to_owned();
            idempotency::complete_idempotency(
                &self.db,
                &key,
                IdempotencyStatus::Completed,
                Some(&json!({"status": "ignored_non_command"})),
            )
            .await?;
            self.audit.append(&record)?;
            return Ok(Some(record));
        }

        // Handle with a per-command timeout.
        let (cmd, _) = commands::parse_command(&text);
        let timeout = if cmd == "/resume" {
            self.config.resume_timeout
        } else {
            self.config.command_timeout
        };

        let handled = tokio::time::timeout(
            timeout,
            commands::handle_command(&self.db, &self.router, &actor, &text, &trace_id),
        )
        .await;

        let mut reply: Option<String> = None;
        match handled {
            Err(_elapsed) => {
                record.status = "command_timeout".to_owned();
                record.error = Some(format!("command_timeout after {}s", timeout.as_secs()));
                idempotency::complete_idempotency(
                    &self.db,
                    &key,
                    IdempotencyStatus::Completed,
                    Some(&json!({"status": "command_timeout"})),
                )
                .await?;
                reply = Some(format!("Error: command timed out after {}s", timeout.as_secs()));
            }
            Ok(Err(e)) => {
                record.status = "error".to_owned();
                record.error = Some(e.to_string());
                idempotency::complete_idempotency(
                    &self.db,
                    &key,
                    IdempotencyStatus::Completed,
                    Some(&json!({"status": "error", "error": e.to_string()})),
                )
                .await?;
                reply = Some(format!("Error: {e}"));
            }
            Ok(Ok((reply_text, result))) => {
                record.status = "ok".to_owned();
                record.result = Some(result.clone());
                idempotency::complete_idempotency(
                    &self.db,
                    &key,
                    IdempotencyStatus::Completed,
                    Some(&json!({"status": "ok", "result": result})),
                )
                .await?;
                reply = Some(reply_text);
            }
        }

        // Exactly one audit line per update, then at most one reply.
        self.audit.append(&record)?;
        if let Some(reply_text) = reply {
            self.reply_best_effort(chat_id, &reply_text).await;
        }
        Ok(Some(record))
    }

    async fn reply_best_effort(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.transport.send_message(chat_id, text).await {
            warn!(chat_id, error = %e, "failed to send reply");
        }
    }

    /// The steady long-poll loop. Holds the ingress lock for its entire
    /// lifetime and persists the offset cursor after each processed
    /// update.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let _lock = IngressLock::acquire(&self.config.lock_file)?;

        let mut startup = AuditRecord::loop_status("startup");
        startup.allowed_chat_ids_count = Some(self.config.allowed_chat_ids.len());
        startup.command_timeout_seconds = Some(self.config.command_timeout.as_secs());
        self.audit.append(&startup)?;

        let mut offset = read_offset(&self.config.offset_file);
        let mut error_count: u64 = 0;
        let base_backoff = self.config.poll_interval.max(Duration::from_millis(200));
        let mut backoff = base_backoff;

        info!(offset, "ingress loop started");

        loop {
            if cancel.is_cancelled() {
                info!("ingress loop cancelled");
                return Ok(());
            }

            let fetched = tokio::select! {
                fetched = self
                    .transport
                    .fetch_updates(offset, self.config.poll_timeout_seconds) => fetched,
                _ = cancel.cancelled() => return Ok(()),
            };

            match fetched {
                Ok(updates) => {
                    if error_count > 0 {
                        let mut recovered = AuditRecord::loop_status("poll_recovered");
                        recovered.error_count = Some(error_count);
                        self.audit.append(&recovered)?;
                    }
                    error_count = 0;
                    backoff = base_backoff;

                    for update in &updates {
                        if let Err(e) = self.process_update(update).await {
                            // Registry or audit I/O failure: the update is
                            // not marked processed, so it will be retried
                            // on the next fetch at the same offset.
                            warn!(update_id = update.update_id, error = %e, "failed to process update");
                            break;
                        }
                        offset = update.update_id + 1;
                        write_offset(&self.config.offset_file, offset)?;
                    }
                }
                Err(e) => {
                    error_count += 1;
                    let mut record = AuditRecord::loop_status("poll_error");
                    record.error_count = Some(error_count);
                    record.backoff_seconds = Some((backoff.as_secs_f64() * 100.0).round() / 100.0);
                    record.error = Some(e.to_string());
                    self.audit.append(&record)?;

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Ok(()),
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}
