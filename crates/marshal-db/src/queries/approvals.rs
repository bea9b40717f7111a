//! Query functions for the `approvals` table.
//!
//! At most one non-terminal approval exists per (task_id, action_category);
//! re-requesting refreshes that row instead of inserting a duplicate.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{RegistryError, Result};
use crate::models::{utc_now, Approval, ApprovalStatus, EventType};
use crate::pool::DbPool;

use super::events;

pub(crate) fn row_to_approval(row: &SqliteRow) -> Result<Approval> {
    let status: String = row.try_get("status")?;
    Ok(Approval {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        action_category: row.try_get("action_category")?,
        status: status.parse()?,
        requested_by: row.try_get("requested_by")?,
        decided_by: row.try_get("decided_by")?,
        decision_note: row.try_get("decision_note")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn latest_for_category(
    conn: &mut sqlx::SqliteConnection,
    task_id: &str,
    action_category: &str,
) -> Result<Option<Approval>> {
    let row = sqlx::query(
        "SELECT * FROM approvals WHERE task_id = ? AND action_category = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(task_id)
    .bind(action_category)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(row_to_approval).transpose()
}

async fn task_exists(conn: &mut sqlx::SqliteConnection, task_id: &str) -> Result<()> {
    let row = sqlx::query("SELECT 1 FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(conn)
        .await?;
    if row.is_none() {
        return Err(RegistryError::NotFound(format!("task {task_id}")));
    }
    Ok(())
}

/// Create a `required` approval row, or refresh an existing required row
/// with the new requester and note. A no-op when the latest approval for
/// the category is already terminal.
pub async fn request_approval(
    pool: &DbPool,
    task_id: &str,
    action_category: &str,
    requested_by: &str,
    note: &str,
) -> Result<Approval> {
    let now = utc_now();
    let mut tx = pool.begin().await?;
    task_exists(&mut tx, task_id).await?;

    let existing = latest_for_category(&mut tx, task_id, action_category).await?;
    match existing {
        Some(approval) if approval.status.is_terminal() => {
            // Terminal decisions stand; nothing to refresh.
            tx.commit().await?;
            Ok(approval)
        }
        Some(approval) => {
            sqlx::query(
                "UPDATE approvals SET requested_by = ?, decision_note = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(requested_by)
            .bind(note)
            .bind(&now)
            .bind(approval.id)
            .execute(&mut *tx)
            .await?;
            events::append_tx(
                &mut tx,
                task_id,
                EventType::ApprovalRequested,
                &format!("category={action_category} refreshed by={requested_by}"),
                &now,
            )
            .await?;
            tx.commit().await?;
            get_approval(pool, approval.id).await
        }
        None => {
            let result = sqlx::query(
                "INSERT INTO approvals ( \
                     task_id, action_category, status, requested_by, decision_note, \
                     created_at, updated_at \
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(task_id)
            .bind(action_category)
            .bind(ApprovalStatus::Required.to_string())
            .bind(requested_by)
            .bind(note)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            let id = result.last_insert_rowid();
            events::append_tx(
                &mut tx,
                task_id,
                EventType::ApprovalRequested,
                &format!("category={action_category} by={requested_by}"),
                &now,
            )
            .await?;
            tx.commit().await?;
            get_approval(pool, id).await
        }
    }
}

/// Decide the latest approval for (task_id, action_category).
///
/// Re-deciding to the same terminal outcome is a no-op; re-deciding to a
/// different outcome than an already-terminal approval fails with
/// `IntegrityConflict`.
pub async fn decide_approval(
    pool: &DbPool,
    task_id: &str,
    action_category: &str,
    decision: ApprovalStatus,
    decided_by: &str,
    note: &str,
) -> Result<Approval> {
    if !matches!(decision, ApprovalStatus::Approved | ApprovalStatus::Rejected) {
        return Err(RegistryError::InvalidArgument(format!(
            "decision must be approved or rejected, got {decision}"
        )));
    }

    let now = utc_now();
    let mut tx = pool.begin().await?;
    task_exists(&mut tx, task_id).await?;

    let approval = latest_for_category(&mut tx, task_id, action_category)
        .await?
        .ok_or_else(|| {
            RegistryError::NotFound(format!(
                "approval for task {task_id} category {action_category}"
            ))
        })?;

    if approval.status.is_terminal() {
        if approval.status == decision {
            // Idempotent re-decision.
            tx.commit().await?;
            return Ok(approval);
        }
        return Err(RegistryError::IntegrityConflict(format!(
            "approval for task {task_id} category {action_category} already {}, cannot {decision}",
            approval.status
        )));
    }

    sqlx::query(
        "UPDATE approvals SET status = ?, decided_by = ?, decision_note = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(decision.to_string())
    .bind(decided_by)
    .bind(note)
    .bind(&now)
    .bind(approval.id)
    .execute(&mut *tx)
    .await?;

    events::append_tx(
        &mut tx,
        task_id,
        EventType::ApprovalDecision,
        &format!("category={action_category} decision={decision} by={decided_by}"),
        &now,
    )
    .await?;
    tx.commit().await?;

    get_approval(pool, approval.id).await
}

/// Fetch a single approval row by rowid.
pub async fn get_approval(pool: &DbPool, id: i64) -> Result<Approval> {
    let row = sqlx::query("SELECT * FROM approvals WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("approval {id}")))?;
    row_to_approval(&row)
}

/// List a task's approvals in insertion order.
pub async fn list_approvals(pool: &DbPool, task_id: &str) -> Result<Vec<Approval>> {
    let rows = sqlx::query("SELECT * FROM approvals WHERE task_id = ? ORDER BY id ASC")
        .bind(task_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_approval).collect()
}

/// Latest approval for a task and category, if any.
pub async fn latest_approval(
    pool: &DbPool,
    task_id: &str,
    action_category: &str,
) -> Result<Option<Approval>> {
    let row = sqlx::query(
        "SELECT * FROM approvals WHERE task_id = ? AND action_category = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(task_id)
    .bind(action_category)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_approval).transpose()
}
