//! Durable task registry for the marshal control plane.
//!
//! Owns every persisted table (tasks, task_events, approvals,
//! task_dispatch_lease, idempotency_keys) and exposes typed operations
//! over a SQLite pool. Every mutating operation appends a task event in
//! the same transaction as the mutation.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;
pub mod transitions;

pub use config::DbConfig;
pub use error::RegistryError;
pub use pool::{connect, init_schema, DbPool};
