use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RegistryError;

/// Current UTC time as the canonical RFC 3339 string stored in every row.
///
/// The fixed `+00:00` offset and microsecond precision keep timestamps
/// lexicographically comparable, which the window queries rely on.
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Parse a stored registry timestamp.
pub fn parse_ts(value: &str) -> Result<DateTime<Utc>, RegistryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RegistryError::Corrupted(format!("bad timestamp {value:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Requested,
    Pending,
    Approved,
    Queued,
    Running,
    Blocked,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl TaskStatus {
    /// Whether this status is terminal (absorbing without a force update).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "blocked" => Ok(Self::Blocked),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            // "canceled" is accepted on input and normalised; the registry
            // only ever emits "cancelled".
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(RegistryError::InvalidArgument(format!(
                "invalid task status: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------

/// Worker tier selector: small local tasks vs supervised larger tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteClass {
    #[serde(rename = "LIGHT")]
    Light,
    #[serde(rename = "HEAVY")]
    Heavy,
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Light => "LIGHT",
            Self::Heavy => "HEAVY",
        };
        f.write_str(s)
    }
}

impl FromStr for RouteClass {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LIGHT" => Ok(Self::Light),
            "HEAVY" => Ok(Self::Heavy),
            other => Err(RegistryError::InvalidArgument(format!(
                "invalid route class: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------

/// Risk level assigned at classification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for RiskLevel {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(RegistryError::InvalidArgument(format!(
                "invalid risk level: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of an approval row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Required,
    Approved,
    Rejected,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Required)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Required => "required",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "required" => Ok(Self::Required),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(RegistryError::InvalidArgument(format!(
                "invalid approval status: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a dispatch lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl LeaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for LeaseStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(RegistryError::InvalidArgument(format!(
                "invalid lease status: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Conflict,
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

impl FromStr for IdempotencyStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "conflict" => Ok(Self::Conflict),
            other => Err(RegistryError::InvalidArgument(format!(
                "invalid idempotency status: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------

/// Scope of an idempotency key. The two ad-hoc layers (chat update and
/// dispatch attempt) share one table with a scope column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyScope {
    /// Router dispatch attempts; keys look like `dispatch:{task_id}:{n}`.
    Dispatch,
    /// Chat updates; keys look like `tg_update:{update_id}`.
    TelegramCommand,
}

impl fmt::Display for IdempotencyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dispatch => "dispatch",
            Self::TelegramCommand => "telegram_command",
        };
        f.write_str(s)
    }
}

impl FromStr for IdempotencyScope {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispatch" => Ok(Self::Dispatch),
            "telegram_command" => Ok(Self::TelegramCommand),
            other => Err(RegistryError::InvalidArgument(format!(
                "invalid idempotency scope: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of a task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    StatusUpdated,
    ApprovalRequested,
    ApprovalDecision,
    MetadataUpdated,
    Lease,
    Router,
    Telemetry,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::StatusUpdated => "status_updated",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalDecision => "approval_decision",
            Self::MetadataUpdated => "metadata_updated",
            Self::Lease => "lease",
            Self::Router => "router",
            Self::Telemetry => "telemetry",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "status_updated" => Ok(Self::StatusUpdated),
            "approval_requested" => Ok(Self::ApprovalRequested),
            "approval_decision" => Ok(Self::ApprovalDecision),
            "metadata_updated" => Ok(Self::MetadataUpdated),
            "lease" => Ok(Self::Lease),
            "router" => Ok(Self::Router),
            "telemetry" => Ok(Self::Telemetry),
            other => Err(RegistryError::InvalidArgument(format!(
                "invalid event type: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task row with decoded metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    pub prompt: String,
    pub route_class: RouteClass,
    pub status: TaskStatus,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,
    pub assigned_worker: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub metadata: Value,
}

/// Summary row for task listings (no prompt or metadata payloads).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub task_type: String,
    pub route_class: RouteClass,
    pub status: TaskStatus,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,
    pub assigned_worker: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// An append-only task event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: String,
    pub event_type: EventType,
    pub detail: String,
    pub created_at: String,
}

/// An approval row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: i64,
    pub task_id: String,
    pub action_category: String,
    pub status: ApprovalStatus,
    pub requested_by: String,
    pub decided_by: Option<String>,
    pub decision_note: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A dispatch lease row. One lease per task; attempt_count is monotone
/// non-decreasing across the task's dispatch life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchLease {
    pub task_id: String,
    pub owner_id: String,
    pub lease_status: LeaseStatus,
    pub attempt_count: i64,
    pub lease_expires_at: String,
    pub heartbeat_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DispatchLease {
    /// Whether the lease has expired as of `now`. A lease at exactly
    /// `lease_expires_at` is treated as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        Ok(now >= parse_ts(&self.lease_expires_at)?)
    }
}

/// An idempotency record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub scope: IdempotencyScope,
    pub task_id: Option<String>,
    pub payload_hash: String,
    pub status: IdempotencyStatus,
    pub result: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// Full task view joined with its events, approvals, and lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub events: Vec<TaskEvent>,
    pub approvals: Vec<Approval>,
    pub lease: Option<DispatchLease>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
