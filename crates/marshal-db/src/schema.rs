//! Embedded registry schema.
//!
//! A single idempotent script (`CREATE ... IF NOT EXISTS` throughout) so
//! that `init` can be re-run safely and first-use initialization needs no
//! separate migration state. An external schema file can be supplied via
//! `ZHC_TASK_SCHEMA` to override this embedded copy.

/// The registry schema applied by [`crate::pool::init_schema`].
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id           TEXT PRIMARY KEY,
    task_type         TEXT NOT NULL,
    prompt            TEXT NOT NULL,
    route_class       TEXT NOT NULL,
    status            TEXT NOT NULL,
    requires_approval INTEGER NOT NULL DEFAULT 0,
    risk_level        TEXT NOT NULL DEFAULT 'low',
    assigned_worker   TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    metadata_json     TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS task_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    TEXT NOT NULL,
    event_type TEXT NOT NULL,
    detail     TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_events_task_id ON task_events (task_id);
CREATE INDEX IF NOT EXISTS idx_task_events_created_at ON task_events (created_at);

CREATE TABLE IF NOT EXISTS approvals (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id         TEXT NOT NULL,
    action_category TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'required',
    requested_by    TEXT NOT NULL DEFAULT '',
    decided_by      TEXT,
    decision_note   TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_approvals_task_id ON approvals (task_id);

CREATE TABLE IF NOT EXISTS task_dispatch_lease (
    task_id          TEXT PRIMARY KEY,
    owner_id         TEXT NOT NULL,
    lease_status     TEXT NOT NULL DEFAULT 'queued',
    attempt_count    INTEGER NOT NULL DEFAULT 0,
    lease_expires_at TEXT NOT NULL,
    heartbeat_at     TEXT,
    last_error       TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key          TEXT PRIMARY KEY,
    scope        TEXT NOT NULL,
    task_id      TEXT,
    payload_hash TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'processing',
    result_json  TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_idempotency_scope ON idempotency_keys (scope);
"#;
