//! Output helpers: `--json` prints pretty JSON, otherwise a short human
//! line per record.

use serde::Serialize;

use marshal_db::models::{Approval, DispatchLease, IdempotencyRecord, TaskEvent, TaskSummary};

/// Print any serializable value as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a value: JSON when requested, else via the provided line
/// formatter.
pub fn emit<T: Serialize>(
    value: &T,
    json: bool,
    human: impl FnOnce(&T) -> String,
) -> anyhow::Result<()> {
    if json {
        print_json(value)
    } else {
        println!("{}", human(value));
        Ok(())
    }
}

pub fn task_line(task: &TaskSummary) -> String {
    format!(
        "{} {} {} type={} risk={}",
        task.task_id, task.status, task.route_class, task.task_type, task.risk_level
    )
}

pub fn event_line(event: &TaskEvent) -> String {
    format!(
        "{} {} [{}] {}",
        event.created_at, event.task_id, event.event_type, event.detail
    )
}

pub fn approval_line(approval: &Approval) -> String {
    format!(
        "{} {} {} requested_by={} decided_by={}",
        approval.task_id,
        approval.action_category,
        approval.status,
        approval.requested_by,
        approval.decided_by.as_deref().unwrap_or("-")
    )
}

pub fn lease_line(lease: &DispatchLease) -> String {
    format!(
        "{} {} owner={} attempt={} expires={}",
        lease.task_id, lease.lease_status, lease.owner_id, lease.attempt_count,
        lease.lease_expires_at
    )
}

pub fn idempotency_line(record: &IdempotencyRecord) -> String {
    format!(
        "{} scope={} status={} task={}",
        record.key,
        record.scope,
        record.status,
        record.task_id.as_deref().unwrap_or("-")
    )
}
