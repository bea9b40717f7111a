//! Query functions for the append-only `task_events` table.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::Result;
use crate::models::{EventType, TaskEvent};
use crate::pool::DbPool;

pub(crate) fn row_to_event(row: &SqliteRow) -> Result<TaskEvent> {
    let event_type: String = row.try_get("event_type")?;
    Ok(TaskEvent {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        event_type: event_type.parse()?,
        detail: row.try_get("detail")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Append an event inside an open transaction. Every mutating registry
/// operation routes through here so the mutation and its event commit
/// together.
pub(crate) async fn append_tx(
    conn: &mut sqlx::SqliteConnection,
    task_id: &str,
    event_type: EventType,
    detail: &str,
    now: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_events (task_id, event_type, detail, created_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(event_type.to_string())
    .bind(detail)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// List events for a task in insertion order.
pub async fn list_events(pool: &DbPool, task_id: &str, limit: i64) -> Result<Vec<TaskEvent>> {
    let rows = sqlx::query(
        "SELECT id, task_id, event_type, detail, created_at \
         FROM task_events WHERE task_id = ? ORDER BY id ASC LIMIT ?",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_event).collect()
}

/// Cross-task lookup by trace id: a substring match on the event detail,
/// newest first. Trace ids are embedded in detail strings by the router
/// and the ingress.
pub async fn trace_events(pool: &DbPool, trace_id: &str, limit: i64) -> Result<Vec<TaskEvent>> {
    let pattern = format!("%{trace_id}%");
    let rows = sqlx::query(
        "SELECT id, task_id, event_type, detail, created_at \
         FROM task_events WHERE detail LIKE ? ORDER BY id DESC LIMIT ?",
    )
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_event).collect()
}
