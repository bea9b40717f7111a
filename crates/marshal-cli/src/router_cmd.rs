//! `marshal router` subcommands.

use std::str::FromStr;

use clap::Subcommand;

use marshal_core::config::PlaneConfig;
use marshal_core::router::Router;
use marshal_db::models::ApprovalStatus;
use marshal_db::{pool, DbConfig};

use crate::output;

#[derive(Subcommand)]
pub enum RouterCommands {
    /// Classify, create, gate, and dispatch a task
    Route {
        #[arg(long)]
        task_type: String,
        #[arg(long)]
        prompt: String,
        /// Correlation tag stored in metadata and event details
        #[arg(long)]
        trace_id: Option<String>,
    },
    /// Classify without creating a task
    Classify {
        #[arg(long)]
        task_type: String,
        #[arg(long)]
        prompt: String,
    },
    /// Record an approval decision, then dispatch unless deferred
    Approve {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        action_category: String,
        #[arg(long)]
        decided_by: String,
        #[arg(long, default_value = "")]
        note: String,
        /// approved or rejected
        #[arg(long, default_value = "approved")]
        decision: String,
        /// Record the decision only; the operator resumes explicitly
        #[arg(long)]
        defer_dispatch: bool,
    },
    /// Write the planner artifact for a HEAVY task
    RecordPlan {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        author: String,
        #[arg(long)]
        summary: String,
    },
    /// Write the reviewer artifact for a HEAVY task
    RecordReview {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        reviewer: String,
        /// pass or fail
        #[arg(long)]
        verdict: String,
        #[arg(long, default_value = "")]
        reason_code: String,
        /// JSON object with the five required boolean checks
        #[arg(long)]
        checklist_json: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Reconcile leases and dispatch a task whose blockers cleared
    Resume {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        requested_by: String,
    },
}

fn route_outcome_line(outcome: &marshal_core::router::RouteOutcome) -> String {
    format!(
        "{} {} {} policy={}({}) pending=[{}] {}",
        outcome.task_id,
        outcome.status,
        outcome.route_class,
        outcome.policy_status,
        outcome.policy_reason,
        outcome.pending.join(","),
        outcome.message
    )
}

pub async fn run(config: &DbConfig, command: RouterCommands, json: bool) -> anyhow::Result<()> {
    let db = pool::open(config).await?;
    let router = Router::new(db, PlaneConfig::from_env());

    match command {
        RouterCommands::Route {
            task_type,
            prompt,
            trace_id,
        } => {
            let outcome = router.route(&task_type, &prompt, trace_id.as_deref()).await?;
            output::emit(&outcome, json, route_outcome_line)
        }

        RouterCommands::Classify { task_type, prompt } => {
            let outcome = router.classify_only(&task_type, &prompt)?;
            output::emit(&outcome, json, |o| {
                format!(
                    "route={} risk={} approval_required={}",
                    o.route_class, o.risk_level, o.approval_required
                )
            })
        }

        RouterCommands::Approve {
            task_id,
            action_category,
            decided_by,
            note,
            decision,
            defer_dispatch,
        } => {
            let outcome = router
                .approve(
                    &task_id,
                    &action_category,
                    &decided_by,
                    &note,
                    ApprovalStatus::from_str(&decision)?,
                    defer_dispatch,
                )
                .await?;
            output::emit(&outcome, json, route_outcome_line)
        }

        RouterCommands::RecordPlan {
            task_id,
            author,
            summary,
        } => {
            let outcome = router.record_plan(&task_id, &author, &summary).await?;
            output::emit(&outcome, json, |o| o.message.clone())
        }

        RouterCommands::RecordReview {
            task_id,
            reviewer,
            verdict,
            reason_code,
            checklist_json,
            notes,
        } => {
            let checklist: serde_json::Value = serde_json::from_str(&checklist_json)
                .map_err(|e| anyhow::anyhow!("--checklist-json must be valid JSON: {e}"))?;
            let outcome = router
                .record_review(&task_id, &reviewer, &verdict, &reason_code, &checklist, &notes)
                .await?;
            output::emit(&outcome, json, |o| {
                format!("{} review={} reason={} {}", o.task_id, o.verdict, o.reason_code, o.next_action)
            })
        }

        RouterCommands::Resume {
            task_id,
            requested_by,
        } => {
            let outcome = router.resume(&task_id, &requested_by).await?;
            output::emit(&outcome, json, route_outcome_line)
        }
    }
}
