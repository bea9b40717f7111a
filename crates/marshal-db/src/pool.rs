use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use crate::config::DbConfig;
use crate::error::Result;
use crate::schema::SCHEMA_SQL;

/// Connection pool over the registry's SQLite database.
pub type DbPool = sqlx::SqlitePool;

/// Open a pool against the configured database file.
///
/// The parent directory is created on demand so first use works from a
/// clean checkout. WAL mode plus a busy timeout keeps concurrent CLI and
/// ingress callers from tripping over each other's short transactions.
pub async fn connect(config: &DbConfig) -> Result<DbPool> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::RegistryError::InvalidArgument(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }
    connect_url(&config.connect_url()).await
}

/// Open a pool from a raw sqlx URL (`sqlite::memory:` in tests).
pub async fn connect_url(url: &str) -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(url)
        .await?;
    Ok(pool)
}

/// Apply the registry schema. Idempotent: every statement is
/// `CREATE ... IF NOT EXISTS`, so re-running against an initialized
/// database is a no-op.
///
/// When `schema_path` points at a readable file (the `ZHC_TASK_SCHEMA`
/// override), its contents replace the embedded schema.
pub async fn init_schema(pool: &DbPool, schema_path: Option<&Path>) -> Result<()> {
    let sql = match schema_path {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            crate::error::RegistryError::InvalidArgument(format!(
                "schema not found: {}: {e}",
                path.display()
            ))
        })?,
        None => SCHEMA_SQL.to_owned(),
    };

    let mut tx = pool.begin().await?;
    for statement in sql.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    info!("registry schema applied");
    Ok(())
}

/// Connect and initialize in one step: the registry's init-on-first-use
/// entry point used by the CLI and the ingress.
pub async fn open(config: &DbConfig) -> Result<DbPool> {
    let pool = connect(config).await?;
    init_schema(&pool, None).await?;
    Ok(pool)
}
