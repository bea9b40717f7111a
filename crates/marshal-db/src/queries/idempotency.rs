//! Query functions for the `idempotency_keys` table.
//!
//! One table serves both idempotency layers (chat updates and dispatch
//! attempts), distinguished by scope and key prefix: `tg_update:{id}` and
//! `dispatch:{task_id}:{attempt}`.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{RegistryError, Result};
use crate::models::{utc_now, IdempotencyRecord, IdempotencyScope, IdempotencyStatus};
use crate::pool::DbPool;

/// Outcome of a `begin_idempotency` call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BeginOutcome {
    /// A record for this key already existed.
    pub exists: bool,
    /// The record is (now) in conflict: the payload hash differed.
    pub conflict: bool,
    pub status: IdempotencyStatus,
    pub result: Option<Value>,
}

fn row_to_record(row: &SqliteRow) -> Result<IdempotencyRecord> {
    let scope: String = row.try_get("scope")?;
    let status: String = row.try_get("status")?;
    let result_json: Option<String> = row.try_get("result_json")?;
    let result = result_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| RegistryError::Corrupted(format!("bad idempotency result json: {e}")))?;
    Ok(IdempotencyRecord {
        key: row.try_get("key")?,
        scope: scope.parse()?,
        task_id: row.try_get("task_id")?,
        payload_hash: row.try_get("payload_hash")?,
        status: status.parse()?,
        result,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Begin (or replay) an idempotent operation.
///
/// First call inserts a `processing` record and returns `exists = false`.
/// A replay with the same payload hash returns the stored outcome. A
/// replay with a different payload hash transitions the record to
/// `conflict` and surfaces the stored result; the caller must not run the
/// side effect.
pub async fn begin_idempotency(
    pool: &DbPool,
    key: &str,
    scope: IdempotencyScope,
    payload_hash: &str,
    task_id: Option<&str>,
) -> Result<BeginOutcome> {
    let now = utc_now();
    let mut tx = pool.begin().await?;

    let row = sqlx::query("SELECT * FROM idempotency_keys WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

    let outcome = match row {
        None => {
            sqlx::query(
                "INSERT INTO idempotency_keys ( \
                     key, scope, task_id, payload_hash, status, created_at, updated_at \
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(key)
            .bind(scope.to_string())
            .bind(task_id)
            .bind(payload_hash)
            .bind(IdempotencyStatus::Processing.to_string())
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            BeginOutcome {
                exists: false,
                conflict: false,
                status: IdempotencyStatus::Processing,
                result: None,
            }
        }
        Some(row) => {
            let record = row_to_record(&row)?;
            if record.payload_hash == payload_hash {
                BeginOutcome {
                    exists: true,
                    conflict: record.status == IdempotencyStatus::Conflict,
                    status: record.status,
                    result: record.result,
                }
            } else {
                sqlx::query(
                    "UPDATE idempotency_keys SET status = ?, updated_at = ? WHERE key = ?",
                )
                .bind(IdempotencyStatus::Conflict.to_string())
                .bind(&now)
                .bind(key)
                .execute(&mut *tx)
                .await?;
                BeginOutcome {
                    exists: true,
                    conflict: true,
                    status: IdempotencyStatus::Conflict,
                    result: record.result,
                }
            }
        }
    };

    tx.commit().await?;
    Ok(outcome)
}

/// Finalize an idempotency record with its status and result payload.
pub async fn complete_idempotency(
    pool: &DbPool,
    key: &str,
    status: IdempotencyStatus,
    result: Option<&Value>,
) -> Result<IdempotencyRecord> {
    let now = utc_now();
    let result_json = result
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RegistryError::InvalidArgument(format!("result not serializable: {e}")))?;

    let outcome = sqlx::query(
        "UPDATE idempotency_keys SET status = ?, result_json = ?, updated_at = ? WHERE key = ?",
    )
    .bind(status.to_string())
    .bind(result_json)
    .bind(&now)
    .bind(key)
    .execute(pool)
    .await?;

    if outcome.rows_affected() == 0 {
        return Err(RegistryError::NotFound(format!("idempotency key {key}")));
    }
    get_idempotency(pool, key).await
}

/// Fetch a record by key.
pub async fn get_idempotency(pool: &DbPool, key: &str) -> Result<IdempotencyRecord> {
    let row = sqlx::query("SELECT * FROM idempotency_keys WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("idempotency key {key}")))?;
    row_to_record(&row)
}

/// List recent records, optionally filtered by scope.
pub async fn list_idempotency(
    pool: &DbPool,
    scope: Option<IdempotencyScope>,
    limit: i64,
) -> Result<Vec<IdempotencyRecord>> {
    let rows = match scope {
        Some(scope) => {
            sqlx::query(
                "SELECT * FROM idempotency_keys WHERE scope = ? \
                 ORDER BY updated_at DESC LIMIT ?",
            )
            .bind(scope.to_string())
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query("SELECT * FROM idempotency_keys ORDER BY updated_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    rows.iter().map(row_to_record).collect()
}
