//! Control-plane logic for the marshal worker fleet.
//!
//! The registry (`marshal-db`) owns all persisted state; this crate owns
//! everything in front of it: classification, policy, artifact gating,
//! the router/dispatcher, context compaction, cost estimation, worker
//! invocation, the long-poll ingress, and operational metrics.

pub mod classify;
pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod gate;
pub mod ingress;
pub mod metrics;
pub mod policy;
pub mod router;
pub mod worker;

pub use config::PlaneConfig;
pub use error::CoreError;
pub use router::Router;
