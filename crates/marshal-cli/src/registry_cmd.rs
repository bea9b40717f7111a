//! `marshal registry` subcommands: a thin wrapper over the typed registry
//! operations, preserving the external CLI surface (init-on-first-use,
//! `--json` output, exit code 1 with a single stderr line on error).

use std::path::PathBuf;
use std::str::FromStr;

use clap::Subcommand;
use serde_json::Value;

use marshal_core::config::PlaneConfig;
use marshal_db::models::{
    ApprovalStatus, IdempotencyScope, IdempotencyStatus, LeaseStatus, RiskLevel, RouteClass,
    TaskStatus,
};
use marshal_db::queries::{approvals, events, idempotency, leases, ops, tasks};
use marshal_db::{pool, DbConfig};

use crate::output;

#[derive(Subcommand)]
pub enum RegistryCommands {
    /// Initialize the registry schema (idempotent)
    Init {
        /// Override the embedded schema with a SQL file (ZHC_TASK_SCHEMA)
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Create a task
    Create {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        task_type: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        route_class: String,
        #[arg(long, default_value = "pending")]
        status: String,
        #[arg(long)]
        requires_approval: bool,
        #[arg(long, default_value = "low")]
        risk_level: String,
        #[arg(long)]
        assigned_worker: Option<String>,
        /// JSON object merged into the task metadata
        #[arg(long, default_value = "{}")]
        metadata: String,
    },
    /// Update task status (state machine enforced unless --force)
    Update {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        status: String,
        #[arg(long, default_value = "")]
        detail: String,
        /// Bypass the transition check (recorded in the event log)
        #[arg(long)]
        force: bool,
    },
    /// Get a task with its events, approvals, and lease
    Get {
        #[arg(long)]
        task_id: String,
    },
    /// List recent tasks
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Aggregate dispatch telemetry over recent tasks
    Telemetry {
        #[arg(long, default_value_t = 500)]
        limit: i64,
    },
    /// Request (or refresh) a human approval
    ApprovalRequest {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        action_category: String,
        #[arg(long)]
        requested_by: String,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Decide the latest approval for a category
    ApprovalDecide {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        action_category: String,
        /// approved or rejected
        #[arg(long)]
        decision: String,
        #[arg(long)]
        decided_by: String,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// List a task's approvals
    ApprovalList {
        #[arg(long)]
        task_id: String,
    },
    /// Shallow-merge a JSON object into task metadata
    MetadataMerge {
        #[arg(long)]
        task_id: String,
        /// JSON object patch
        #[arg(long)]
        patch: String,
        #[arg(long, default_value = "")]
        detail: String,
    },
    /// Create or requeue a dispatch lease
    LeaseEnqueue {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        owner: String,
        #[arg(long, default_value_t = 120)]
        lease_seconds: i64,
    },
    /// Claim a dispatch lease
    LeaseClaim {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        owner: String,
        #[arg(long, default_value_t = 120)]
        lease_seconds: i64,
    },
    /// Extend a running lease
    LeaseHeartbeat {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        owner: String,
        #[arg(long, default_value_t = 120)]
        lease_seconds: i64,
    },
    /// Record a lease's terminal state
    LeaseFinish {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        owner: String,
        /// succeeded, failed, cancelled, or expired
        #[arg(long)]
        result_status: String,
        #[arg(long)]
        last_error: Option<String>,
    },
    /// Revert expired running leases to queued
    LeaseReconcile {
        #[arg(long)]
        owner: String,
    },
    /// Show a task's lease
    LeaseGet {
        #[arg(long)]
        task_id: String,
    },
    /// List leases
    LeaseList {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Begin (or replay) an idempotent operation
    IdempoBegin {
        #[arg(long)]
        key: String,
        /// dispatch or telegram_command
        #[arg(long)]
        scope: String,
        #[arg(long)]
        payload_hash: String,
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Finalize an idempotency record
    IdempoComplete {
        #[arg(long)]
        key: String,
        /// processing, completed, or conflict
        #[arg(long)]
        status: String,
        /// JSON result payload
        #[arg(long)]
        result: Option<String>,
    },
    /// Show an idempotency record
    IdempoGet {
        #[arg(long)]
        key: String,
    },
    /// List idempotency records
    IdempoList {
        #[arg(long)]
        scope: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// List a task's events in insertion order
    Events {
        #[arg(long)]
        task_id: String,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Find events by trace id substring
    TraceEvents {
        #[arg(long)]
        trace_id: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Health summary over a recent window
    OpsSummary {
        #[arg(long, default_value_t = 24)]
        window_hours: i64,
    },
}

fn parse_json_object(raw: &str, what: &str) -> anyhow::Result<Value> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("{what} must be valid JSON: {e}"))?;
    Ok(value)
}

pub async fn run(config: &DbConfig, command: RegistryCommands, json: bool) -> anyhow::Result<()> {
    if let RegistryCommands::Init { schema } = &command {
        let db = pool::connect(config).await?;
        let schema_path = schema
            .clone()
            .or_else(|| std::env::var("ZHC_TASK_SCHEMA").ok().map(PathBuf::from));
        pool::init_schema(&db, schema_path.as_deref()).await?;
        println!("Initialized registry: {}", config.db_path.display());
        return Ok(());
    }

    // Every other command initializes on first use, like the ingress.
    let db = pool::open(config).await?;

    match command {
        RegistryCommands::Init { .. } => unreachable!("handled above"),

        RegistryCommands::Create {
            task_id,
            task_type,
            prompt,
            route_class,
            status,
            requires_approval,
            risk_level,
            assigned_worker,
            metadata,
        } => {
            let metadata = parse_json_object(&metadata, "--metadata")?;
            let task = tasks::create_task(
                &db,
                &tasks::NewTask {
                    task_id,
                    task_type,
                    prompt,
                    route_class: RouteClass::from_str(&route_class)?,
                    status: TaskStatus::from_str(&status)?,
                    requires_approval,
                    risk_level: RiskLevel::from_str(&risk_level)?,
                    assigned_worker,
                    metadata,
                },
            )
            .await?;
            output::emit(&task, json, |t| {
                format!("{} {} {} type={}", t.task_id, t.status, t.route_class, t.task_type)
            })
        }

        RegistryCommands::Update {
            task_id,
            status,
            detail,
            force,
        } => {
            let task =
                tasks::update_task(&db, &task_id, TaskStatus::from_str(&status)?, &detail, force)
                    .await?;
            output::emit(&task, json, |t| format!("{} {}", t.task_id, t.status))
        }

        RegistryCommands::Get { task_id } => {
            let detail = tasks::get_task(&db, &task_id).await?;
            output::emit(&detail, json, |d| {
                format!(
                    "{} {} {} type={} risk={} events={} approvals={}",
                    d.task.task_id,
                    d.task.status,
                    d.task.route_class,
                    d.task.task_type,
                    d.task.risk_level,
                    d.events.len(),
                    d.approvals.len()
                )
            })
        }

        RegistryCommands::List { limit } => {
            let list = tasks::list_tasks(&db, limit).await?;
            if json {
                output::print_json(&list)
            } else {
                for task in &list {
                    println!("{}", output::task_line(task));
                }
                Ok(())
            }
        }

        RegistryCommands::Telemetry { limit } => {
            let summary = ops::telemetry_summary(&db, limit).await?;
            output::emit(&summary, json, |s| {
                format!(
                    "tasks={} avg_dispatch_ms={} total_tokens={} total_cost_usd={}",
                    s.task_count,
                    s.avg_dispatch_duration_ms,
                    s.total_estimated_tokens,
                    s.total_estimated_cost_usd
                )
            })
        }

        RegistryCommands::ApprovalRequest {
            task_id,
            action_category,
            requested_by,
            note,
        } => {
            let approval =
                approvals::request_approval(&db, &task_id, &action_category, &requested_by, &note)
                    .await?;
            output::emit(&approval, json, output::approval_line)
        }

        RegistryCommands::ApprovalDecide {
            task_id,
            action_category,
            decision,
            decided_by,
            note,
        } => {
            let approval = approvals::decide_approval(
                &db,
                &task_id,
                &action_category,
                ApprovalStatus::from_str(&decision)?,
                &decided_by,
                &note,
            )
            .await?;
            output::emit(&approval, json, output::approval_line)
        }

        RegistryCommands::ApprovalList { task_id } => {
            let list = approvals::list_approvals(&db, &task_id).await?;
            if json {
                output::print_json(&list)
            } else {
                for approval in &list {
                    println!("{}", output::approval_line(approval));
                }
                Ok(())
            }
        }

        RegistryCommands::MetadataMerge {
            task_id,
            patch,
            detail,
        } => {
            let patch = parse_json_object(&patch, "--patch")?;
            let task = tasks::merge_metadata(&db, &task_id, &patch, &detail).await?;
            output::emit(&task, json, |t| {
                format!("{} metadata keys={}", t.task_id, t.metadata.as_object().map(|m| m.len()).unwrap_or(0))
            })
        }

        RegistryCommands::LeaseEnqueue {
            task_id,
            owner,
            lease_seconds,
        } => {
            let lease = leases::enqueue_dispatch_lease(&db, &task_id, &owner, lease_seconds).await?;
            output::emit(&lease, json, output::lease_line)
        }

        RegistryCommands::LeaseClaim {
            task_id,
            owner,
            lease_seconds,
        } => {
            let claim = leases::claim_dispatch_lease(&db, &task_id, &owner, lease_seconds).await?;
            output::emit(&claim, json, |c| {
                format!("claimed={} reason={} {}", c.claimed, c.reason, output::lease_line(&c.lease))
            })
        }

        RegistryCommands::LeaseHeartbeat {
            task_id,
            owner,
            lease_seconds,
        } => {
            let lease =
                leases::heartbeat_dispatch_lease(&db, &task_id, &owner, lease_seconds).await?;
            output::emit(&lease, json, output::lease_line)
        }

        RegistryCommands::LeaseFinish {
            task_id,
            owner,
            result_status,
            last_error,
        } => {
            let lease = leases::finish_dispatch_lease(
                &db,
                &task_id,
                &owner,
                LeaseStatus::from_str(&result_status)?,
                last_error.as_deref(),
            )
            .await?;
            output::emit(&lease, json, output::lease_line)
        }

        RegistryCommands::LeaseReconcile { owner } => {
            let reclaimed = leases::reconcile_dispatch_leases(&db, &owner).await?;
            output::emit(&reclaimed, json, |r| format!("reconciled={}", r.len()))
        }

        RegistryCommands::LeaseGet { task_id } => {
            let lease = leases::get_lease(&db, &task_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("not found: lease for task {task_id}"))?;
            output::emit(&lease, json, output::lease_line)
        }

        RegistryCommands::LeaseList { limit } => {
            let list = leases::list_leases(&db, limit).await?;
            if json {
                output::print_json(&list)
            } else {
                for lease in &list {
                    println!("{}", output::lease_line(lease));
                }
                Ok(())
            }
        }

        RegistryCommands::IdempoBegin {
            key,
            scope,
            payload_hash,
            task_id,
        } => {
            let outcome = idempotency::begin_idempotency(
                &db,
                &key,
                IdempotencyScope::from_str(&scope)?,
                &payload_hash,
                task_id.as_deref(),
            )
            .await?;
            output::emit(&outcome, json, |o| {
                format!("exists={} conflict={} status={}", o.exists, o.conflict, o.status)
            })
        }

        RegistryCommands::IdempoComplete {
            key,
            status,
            result,
        } => {
            let result = result
                .as_deref()
                .map(|raw| parse_json_object(raw, "--result"))
                .transpose()?;
            let record = idempotency::complete_idempotency(
                &db,
                &key,
                IdempotencyStatus::from_str(&status)?,
                result.as_ref(),
            )
            .await?;
            output::emit(&record, json, output::idempotency_line)
        }

        RegistryCommands::IdempoGet { key } => {
            let record = idempotency::get_idempotency(&db, &key).await?;
            output::emit(&record, json, output::idempotency_line)
        }

        RegistryCommands::IdempoList { scope, limit } => {
            let scope = scope.as_deref().map(IdempotencyScope::from_str).transpose()?;
            let list = idempotency::list_idempotency(&db, scope, limit).await?;
            if json {
                output::print_json(&list)
            } else {
                for record in &list {
                    println!("{}", output::idempotency_line(record));
                }
                Ok(())
            }
        }

        RegistryCommands::Events { task_id, limit } => {
            let list = events::list_events(&db, &task_id, limit).await?;
            if json {
                output::print_json(&list)
            } else {
                for event in &list {
                    println!("{}", output::event_line(event));
                }
                Ok(())
            }
        }

        RegistryCommands::TraceEvents { trace_id, limit } => {
            let list = events::trace_events(&db, &trace_id, limit).await?;
            if json {
                output::print_json(&list)
            } else {
                for event in &list {
                    println!("{}", output::event_line(event));
                }
                Ok(())
            }
        }

        RegistryCommands::OpsSummary { window_hours } => {
            let plane = PlaneConfig::from_env();
            let audit_log = plane
                .storage_root
                .join("memory")
                .join("telegram_command_audit.jsonl");
            let summary = ops::ops_summary(&db, window_hours, Some(&audit_log)).await?;
            output::emit(&summary, json, |s| {
                format!(
                    "status={} stale_leases={} idempo_conflicts={} dispatch_timeouts={} command_timeouts={}",
                    s.status,
                    s.leases.stale,
                    s.idempotency.conflict_window,
                    s.timeouts.dispatch_window,
                    s.timeouts.command_window
                )
            })
        }
    }
}
