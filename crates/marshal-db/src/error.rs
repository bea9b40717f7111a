//! Typed error set for registry operations.
//!
//! Registry operations report errors to the caller and never silently
//! mutate state; a failed operation leaves the database untouched because
//! every mutation runs inside a single transaction.

use thiserror::Error;

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The referenced task, approval, lease, or idempotency key does not
    /// exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested status transition is not permitted by the state
    /// machine.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Malformed input: unknown enum value, bad JSON, invalid checklist.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A conflicting concurrent decision: approval re-decided to a
    /// different outcome, lease owner mismatch, idempotency payload
    /// mismatch.
    #[error("integrity conflict: {0}")]
    IntegrityConflict(String),

    /// Stored state could not be decoded (bad timestamp, bad JSON blob).
    #[error("corrupted record: {0}")]
    Corrupted(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Result alias used across the registry crate.
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
