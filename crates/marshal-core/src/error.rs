//! Control-plane error taxonomy.

use thiserror::Error;

use marshal_db::RegistryError;

/// Errors surfaced by the router, ingress, and worker layers.
///
/// The router recovers locally from `TransientDispatch` (retry) and maps
/// `LeaseHeld` to a pending reason rather than a failure. `PolicyDenied`,
/// `GateBlocked`, and `IntegrityConflict` (via `Registry`) surface to the
/// caller with their reason. The ingress converts every error into an
/// audit status and keeps looping.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Malformed input at the control-plane layer.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The policy evaluator denied execution.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Planner/reviewer artifacts are missing or failing.
    #[error("gate blocked: {0}")]
    GateBlocked(String),

    /// Another owner holds an active dispatch lease.
    #[error("lease held by {0}")]
    LeaseHeld(String),

    /// Worker failure whose error text matched a transient marker;
    /// eligible for retry.
    #[error("transient dispatch failure: {0}")]
    TransientDispatch(String),

    /// Non-transient worker exit.
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    /// A command or dispatch exceeded its wall-clock budget.
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Chat API or child-process invocation failure unrelated to worker
    /// semantics.
    #[error("transport error: {0}")]
    Transport(String),

    /// Filesystem failure for artifacts, audit log, offset, or lock files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the control-plane crate.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
