//! Structured audit log: one JSON line per processed update plus loop
//! incident records (startup, poll_error, poll_recovered).

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// One audit line. Optional fields serialize only when present so update
/// records and loop records share the file without noise.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub ts: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_chat_ids_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_seconds: Option<u64>,
}

impl AuditRecord {
    /// A loop-level record carrying only a status.
    pub fn loop_status(status: &str) -> Self {
        Self {
            ts: marshal_db::models::utc_now(),
            status: status.to_owned(),
            update_id: None,
            chat_id: None,
            actor: None,
            text: None,
            trace_id: None,
            result: None,
            error: None,
            error_count: None,
            backoff_seconds: None,
            allowed_chat_ids_count: None,
            command_timeout_seconds: None,
        }
    }

    /// The per-update skeleton; the pipeline fills in status/result/error.
    pub fn for_update(update_id: i64, chat_id: i64, actor: String, text: String) -> Self {
        let mut record = Self::loop_status("pending");
        record.update_id = Some(update_id);
        record.chat_id = Some(chat_id);
        record.actor = Some(actor);
        record.text = Some(text);
        record.trace_id = Some(format!("tg-{update_id}"));
        record
    }
}

/// Append-only JSONL audit file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record).expect("audit record serializes");
        writeln!(file, "{line}")?;
        Ok(())
    }
}
