//! Per-table query modules for the registry.
//!
//! Every mutating operation opens a transaction, performs the row change,
//! appends at least one task event, and commits. Readers use plain pool
//! queries.

pub mod approvals;
pub mod events;
pub mod idempotency;
pub mod leases;
pub mod ops;
pub mod tasks;
