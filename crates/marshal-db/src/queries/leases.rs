//! Query functions for the `task_dispatch_lease` table.
//!
//! The lease table serializes at-most-one dispatcher owner per task. A
//! running lease blocks other owners until the holder refreshes it or the
//! lease expires; reclaiming an expired lease increments attempt_count.

use chrono::{Duration, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{RegistryError, Result};
use crate::models::{utc_now, DispatchLease, EventType, LeaseStatus};
use crate::pool::DbPool;

use super::events;

/// Outcome of a claim attempt. A denial is not an error; it is a reason.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LeaseClaim {
    pub claimed: bool,
    pub reason: String,
    pub lease: DispatchLease,
}

pub(crate) fn row_to_lease(row: &SqliteRow) -> Result<DispatchLease> {
    let lease_status: String = row.try_get("lease_status")?;
    Ok(DispatchLease {
        task_id: row.try_get("task_id")?,
        owner_id: row.try_get("owner_id")?,
        lease_status: lease_status.parse()?,
        attempt_count: row.try_get("attempt_count")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn expiry_in(lease_seconds: i64) -> String {
    (Utc::now() + Duration::seconds(lease_seconds.max(1)))
        .to_rfc3339_opts(SecondsFormat::Micros, false)
}

async fn fetch_lease(
    conn: &mut sqlx::SqliteConnection,
    task_id: &str,
) -> Result<Option<DispatchLease>> {
    let row = sqlx::query("SELECT * FROM task_dispatch_lease WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(row_to_lease).transpose()
}

/// Fetch a task's lease, if any.
pub async fn get_lease(pool: &DbPool, task_id: &str) -> Result<Option<DispatchLease>> {
    let row = sqlx::query("SELECT * FROM task_dispatch_lease WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_lease).transpose()
}

/// List all leases, newest activity first.
pub async fn list_leases(pool: &DbPool, limit: i64) -> Result<Vec<DispatchLease>> {
    let rows = sqlx::query("SELECT * FROM task_dispatch_lease ORDER BY updated_at DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_lease).collect()
}

/// Create a queued lease, or reset an existing lease back to queued when
/// it is terminal or expired. An active lease is left untouched.
pub async fn enqueue_dispatch_lease(
    pool: &DbPool,
    task_id: &str,
    owner: &str,
    lease_seconds: i64,
) -> Result<DispatchLease> {
    let now = utc_now();
    let now_dt = Utc::now();
    let mut tx = pool.begin().await?;

    let existing = fetch_lease(&mut tx, task_id).await?;
    match existing {
        None => {
            sqlx::query(
                "INSERT INTO task_dispatch_lease ( \
                     task_id, owner_id, lease_status, attempt_count, lease_expires_at, \
                     created_at, updated_at \
                 ) VALUES (?, ?, ?, 0, ?, ?, ?)",
            )
            .bind(task_id)
            .bind(owner)
            .bind(LeaseStatus::Queued.to_string())
            .bind(expiry_in(lease_seconds))
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            events::append_tx(
                &mut tx,
                task_id,
                EventType::Lease,
                &format!("lease_enqueued owner={owner}"),
                &now,
            )
            .await?;
        }
        Some(lease) => {
            let resettable = lease.lease_status.is_terminal() || lease.is_expired_at(now_dt)?;
            if resettable {
                // attempt_count is preserved: it only ever moves forward.
                sqlx::query(
                    "UPDATE task_dispatch_lease \
                     SET owner_id = ?, lease_status = ?, lease_expires_at = ?, \
                         last_error = NULL, updated_at = ? \
                     WHERE task_id = ?",
                )
                .bind(owner)
                .bind(LeaseStatus::Queued.to_string())
                .bind(expiry_in(lease_seconds))
                .bind(&now)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
                events::append_tx(
                    &mut tx,
                    task_id,
                    EventType::Lease,
                    &format!("lease_requeued owner={owner} prev={}", lease.lease_status),
                    &now,
                )
                .await?;
            }
        }
    }
    tx.commit().await?;

    get_lease(pool, task_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("lease for task {task_id}")))
}

/// Attempt to claim the lease for dispatch.
///
/// - Another owner holding a non-expired running lease denies the claim.
/// - The same owner re-claiming a running lease refreshes it (idempotent).
/// - A queued or expired lease is claimed, transitioning to running and
///   incrementing attempt_count.
pub async fn claim_dispatch_lease(
    pool: &DbPool,
    task_id: &str,
    owner: &str,
    lease_seconds: i64,
) -> Result<LeaseClaim> {
    let now = utc_now();
    let now_dt = Utc::now();
    let mut tx = pool.begin().await?;

    let lease = fetch_lease(&mut tx, task_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("lease for task {task_id}")))?;

    let expired = lease.is_expired_at(now_dt)?;

    if lease.lease_status == LeaseStatus::Running && !expired {
        if lease.owner_id == owner {
            sqlx::query(
                "UPDATE task_dispatch_lease \
                 SET lease_expires_at = ?, heartbeat_at = ?, updated_at = ? \
                 WHERE task_id = ?",
            )
            .bind(expiry_in(lease_seconds))
            .bind(&now)
            .bind(&now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            events::append_tx(
                &mut tx,
                task_id,
                EventType::Lease,
                &format!("lease_refreshed owner={owner}"),
                &now,
            )
            .await?;
            tx.commit().await?;
            let lease = get_lease(pool, task_id).await?.expect("lease just updated");
            return Ok(LeaseClaim {
                claimed: true,
                reason: "refreshed".into(),
                lease,
            });
        }
        tx.commit().await?;
        return Ok(LeaseClaim {
            claimed: false,
            reason: "held_by_other_owner".into(),
            lease,
        });
    }

    let reason = if lease.lease_status == LeaseStatus::Running {
        "reclaimed_expired"
    } else {
        "claimed"
    };

    sqlx::query(
        "UPDATE task_dispatch_lease \
         SET owner_id = ?, lease_status = ?, attempt_count = attempt_count + 1, \
             lease_expires_at = ?, heartbeat_at = ?, updated_at = ? \
         WHERE task_id = ?",
    )
    .bind(owner)
    .bind(LeaseStatus::Running.to_string())
    .bind(expiry_in(lease_seconds))
    .bind(&now)
    .bind(&now)
    .bind(task_id)
    .execute(&mut *tx)
    .await?;
    events::append_tx(
        &mut tx,
        task_id,
        EventType::Lease,
        &format!("lease_{reason} owner={owner}"),
        &now,
    )
    .await?;
    tx.commit().await?;

    let lease = get_lease(pool, task_id).await?.expect("lease just updated");
    Ok(LeaseClaim {
        claimed: true,
        reason: reason.into(),
        lease,
    })
}

/// Extend a running lease held by `owner`.
pub async fn heartbeat_dispatch_lease(
    pool: &DbPool,
    task_id: &str,
    owner: &str,
    lease_seconds: i64,
) -> Result<DispatchLease> {
    let now = utc_now();
    let mut tx = pool.begin().await?;

    let lease = fetch_lease(&mut tx, task_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("lease for task {task_id}")))?;

    if lease.lease_status != LeaseStatus::Running {
        return Err(RegistryError::IntegrityConflict(format!(
            "lease for task {task_id} is {}, not running",
            lease.lease_status
        )));
    }
    if lease.owner_id != owner {
        return Err(RegistryError::IntegrityConflict(format!(
            "lease for task {task_id} held by {}, not {owner}",
            lease.owner_id
        )));
    }

    sqlx::query(
        "UPDATE task_dispatch_lease \
         SET lease_expires_at = ?, heartbeat_at = ?, updated_at = ? \
         WHERE task_id = ?",
    )
    .bind(expiry_in(lease_seconds))
    .bind(&now)
    .bind(&now)
    .bind(task_id)
    .execute(&mut *tx)
    .await?;
    events::append_tx(
        &mut tx,
        task_id,
        EventType::Lease,
        &format!("lease_heartbeat owner={owner}"),
        &now,
    )
    .await?;
    tx.commit().await?;

    get_lease(pool, task_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("lease for task {task_id}")))
}

/// Record the terminal state of a dispatch attempt.
pub async fn finish_dispatch_lease(
    pool: &DbPool,
    task_id: &str,
    owner: &str,
    result_status: LeaseStatus,
    last_error: Option<&str>,
) -> Result<DispatchLease> {
    if !result_status.is_terminal() {
        return Err(RegistryError::InvalidArgument(format!(
            "finish requires a terminal lease status, got {result_status}"
        )));
    }

    let now = utc_now();
    let mut tx = pool.begin().await?;

    let lease = fetch_lease(&mut tx, task_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("lease for task {task_id}")))?;
    if lease.owner_id != owner {
        return Err(RegistryError::IntegrityConflict(format!(
            "lease for task {task_id} held by {}, not {owner}",
            lease.owner_id
        )));
    }

    sqlx::query(
        "UPDATE task_dispatch_lease \
         SET lease_status = ?, last_error = ?, updated_at = ? \
         WHERE task_id = ?",
    )
    .bind(result_status.to_string())
    .bind(last_error)
    .bind(&now)
    .bind(task_id)
    .execute(&mut *tx)
    .await?;
    events::append_tx(
        &mut tx,
        task_id,
        EventType::Lease,
        &format!("lease_finished status={result_status} owner={owner}"),
        &now,
    )
    .await?;
    tx.commit().await?;

    get_lease(pool, task_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("lease for task {task_id}")))
}

/// Revert expired running leases to queued so a new owner can claim them.
///
/// Returns the task ids that were reclaimed. Called on startup and from
/// `resume` before any dispatch attempt.
pub async fn reconcile_dispatch_leases(pool: &DbPool, new_owner: &str) -> Result<Vec<String>> {
    let now = utc_now();
    let now_dt = Utc::now();
    let mut tx = pool.begin().await?;

    let rows = sqlx::query("SELECT * FROM task_dispatch_lease WHERE lease_status = ?")
        .bind(LeaseStatus::Running.to_string())
        .fetch_all(&mut *tx)
        .await?;

    let mut reclaimed = Vec::new();
    for row in &rows {
        let lease = row_to_lease(row)?;
        if !lease.is_expired_at(now_dt)? {
            continue;
        }
        sqlx::query(
            "UPDATE task_dispatch_lease \
             SET lease_status = ?, last_error = 'lease_expired_reconciled', updated_at = ? \
             WHERE task_id = ?",
        )
        .bind(LeaseStatus::Queued.to_string())
        .bind(&now)
        .bind(&lease.task_id)
        .execute(&mut *tx)
        .await?;
        events::append_tx(
            &mut tx,
            &lease.task_id,
            EventType::Lease,
            &format!("lease_expired_reconciled by={new_owner} prev_owner={}", lease.owner_id),
            &now,
        )
        .await?;
        reclaimed.push(lease.task_id);
    }

    tx.commit().await?;
    Ok(reclaimed)
}
