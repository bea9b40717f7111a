//! Query functions for the `tasks` table.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{RegistryError, Result};
use crate::models::{utc_now, EventType, Task, TaskDetail, TaskStatus, TaskSummary};
use crate::pool::DbPool;
use crate::transitions::StatusMachine;

use super::{approvals, events, leases};

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub task_type: String,
    pub prompt: String,
    pub route_class: crate::models::RouteClass,
    pub status: TaskStatus,
    pub requires_approval: bool,
    pub risk_level: crate::models::RiskLevel,
    pub assigned_worker: Option<String>,
    pub metadata: Value,
}

pub(crate) fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let route_class: String = row.try_get("route_class")?;
    let status: String = row.try_get("status")?;
    let risk_level: String = row.try_get("risk_level")?;
    let requires_approval: i64 = row.try_get("requires_approval")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let metadata: Value = serde_json::from_str(&metadata_json)
        .map_err(|e| RegistryError::Corrupted(format!("bad metadata json: {e}")))?;

    Ok(Task {
        task_id: row.try_get("task_id")?,
        task_type: row.try_get("task_type")?,
        prompt: row.try_get("prompt")?,
        route_class: route_class.parse()?,
        status: status.parse()?,
        requires_approval: requires_approval != 0,
        risk_level: risk_level.parse()?,
        assigned_worker: row.try_get("assigned_worker")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        metadata,
    })
}

fn row_to_summary(row: &SqliteRow) -> Result<TaskSummary> {
    let route_class: String = row.try_get("route_class")?;
    let status: String = row.try_get("status")?;
    let risk_level: String = row.try_get("risk_level")?;
    let requires_approval: i64 = row.try_get("requires_approval")?;
    Ok(TaskSummary {
        task_id: row.try_get("task_id")?,
        task_type: row.try_get("task_type")?,
        route_class: route_class.parse()?,
        status: status.parse()?,
        requires_approval: requires_approval != 0,
        risk_level: risk_level.parse()?,
        assigned_worker: row.try_get("assigned_worker")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new task row plus its `created` event.
pub async fn create_task(pool: &DbPool, new: &NewTask) -> Result<Task> {
    if !new.metadata.is_object() {
        return Err(RegistryError::InvalidArgument(
            "metadata must be a JSON object".into(),
        ));
    }
    let now = utc_now();
    let metadata_json = serde_json::to_string(&new.metadata)
        .map_err(|e| RegistryError::InvalidArgument(format!("metadata not serializable: {e}")))?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO tasks ( \
             task_id, task_type, prompt, route_class, status, \
             requires_approval, risk_level, assigned_worker, \
             created_at, updated_at, metadata_json \
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&new.task_id)
    .bind(&new.task_type)
    .bind(&new.prompt)
    .bind(new.route_class.to_string())
    .bind(new.status.to_string())
    .bind(i64::from(new.requires_approval))
    .bind(new.risk_level.to_string())
    .bind(&new.assigned_worker)
    .bind(&now)
    .bind(&now)
    .bind(&metadata_json)
    .execute(&mut *tx)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => {
            RegistryError::IntegrityConflict(format!("task already exists: {}", new.task_id))
        }
        other => RegistryError::Db(other),
    })?;

    events::append_tx(
        &mut tx,
        &new.task_id,
        EventType::Created,
        &format!("route={}; risk={}", new.route_class, new.risk_level),
        &now,
    )
    .await?;
    tx.commit().await?;

    get_task_row(pool, &new.task_id).await
}

/// Fetch the bare task row.
pub async fn get_task_row(pool: &DbPool, task_id: &str) -> Result<Task> {
    let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("task {task_id}")))?;
    row_to_task(&row)
}

/// Fetch the full task view joined with events, approvals, and lease.
pub async fn get_task(pool: &DbPool, task_id: &str) -> Result<TaskDetail> {
    let task = get_task_row(pool, task_id).await?;
    let task_events = events::list_events(pool, task_id, 500).await?;
    let task_approvals = approvals::list_approvals(pool, task_id).await?;
    let lease = leases::get_lease(pool, task_id).await?;
    Ok(TaskDetail {
        task,
        events: task_events,
        approvals: task_approvals,
        lease,
    })
}

/// List recent tasks, newest first.
pub async fn list_tasks(pool: &DbPool, limit: i64) -> Result<Vec<TaskSummary>> {
    let rows = sqlx::query(
        "SELECT task_id, task_type, route_class, status, requires_approval, \
                risk_level, assigned_worker, created_at, updated_at \
         FROM tasks ORDER BY created_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_summary).collect()
}

/// List recent tasks of a type, newest first. Used by the router's
/// retrieval pass when building context payloads.
pub async fn list_recent_by_type(
    pool: &DbPool,
    task_type: &str,
    limit: i64,
) -> Result<Vec<Task>> {
    let rows = sqlx::query(
        "SELECT * FROM tasks WHERE task_type = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(task_type)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_task).collect()
}

/// Update a task's status, enforcing the state machine unless `force`.
///
/// A forced transition is recorded in the event detail so the audit trail
/// distinguishes overrides from normal flow.
pub async fn update_task(
    pool: &DbPool,
    task_id: &str,
    next_status: TaskStatus,
    detail: &str,
    force: bool,
) -> Result<Task> {
    let now = utc_now();
    let mut tx = pool.begin().await?;

    let row = sqlx::query("SELECT status FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("task {task_id}")))?;
    let current: TaskStatus = row.try_get::<String, _>("status")?.parse()?;

    if !force && !StatusMachine::is_valid_transition(current, next_status) {
        return Err(RegistryError::InvalidTransition {
            from: current.to_string(),
            to: next_status.to_string(),
        });
    }

    sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE task_id = ?")
        .bind(next_status.to_string())
        .bind(&now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

    let event_detail = if detail.is_empty() {
        next_status.to_string()
    } else {
        detail.to_owned()
    };
    let event_detail = if force {
        format!("forced {current}->{next_status}: {event_detail}")
    } else {
        event_detail
    };
    events::append_tx(&mut tx, task_id, EventType::StatusUpdated, &event_detail, &now).await?;
    tx.commit().await?;

    get_task_row(pool, task_id).await
}

/// Shallow-merge a JSON object patch into the task metadata.
///
/// Existing keys not named by the patch are preserved; patched keys
/// replace prior values. Metadata is never silently overwritten wholesale.
pub async fn merge_metadata(
    pool: &DbPool,
    task_id: &str,
    patch: &Value,
    detail: &str,
) -> Result<Task> {
    let patch_obj = patch
        .as_object()
        .ok_or_else(|| RegistryError::InvalidArgument("metadata patch must be a JSON object".into()))?;

    let now = utc_now();
    let mut tx = pool.begin().await?;

    let row = sqlx::query("SELECT metadata_json FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("task {task_id}")))?;
    let stored: String = row.try_get("metadata_json")?;
    let mut merged: Value = serde_json::from_str(&stored)
        .map_err(|e| RegistryError::Corrupted(format!("bad metadata json: {e}")))?;
    if !merged.is_object() {
        merged = Value::Object(serde_json::Map::new());
    }
    let merged_obj = merged.as_object_mut().expect("object ensured above");
    for (k, v) in patch_obj {
        merged_obj.insert(k.clone(), v.clone());
    }

    let merged_json = serde_json::to_string(&merged)
        .map_err(|e| RegistryError::InvalidArgument(format!("metadata not serializable: {e}")))?;
    sqlx::query("UPDATE tasks SET metadata_json = ?, updated_at = ? WHERE task_id = ?")
        .bind(&merged_json)
        .bind(&now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

    let event_detail = if detail.is_empty() {
        format!("metadata keys: {}", patch_obj.keys().cloned().collect::<Vec<_>>().join(","))
    } else {
        detail.to_owned()
    };
    events::append_tx(&mut tx, task_id, EventType::MetadataUpdated, &event_detail, &now).await?;
    tx.commit().await?;

    get_task_row(pool, task_id).await
}

/// Append a router-scoped event outside any other mutation. The router
/// uses this for classification, policy, gate, and dispatch breadcrumbs.
pub async fn append_router_event(pool: &DbPool, task_id: &str, detail: &str) -> Result<()> {
    let now = utc_now();
    let mut tx = pool.begin().await?;
    events::append_tx(&mut tx, task_id, EventType::Router, detail, &now).await?;
    tx.commit().await?;
    Ok(())
}
