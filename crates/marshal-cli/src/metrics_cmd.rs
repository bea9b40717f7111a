//! `marshal metrics` subcommands: windowed operational reports.

use std::path::PathBuf;

use clap::Subcommand;

use marshal_core::config::PlaneConfig;
use marshal_core::metrics::{build_report, MetricsOptions};
use marshal_db::{pool, DbConfig};

use crate::output;

#[derive(Subcommand)]
pub enum MetricsCommands {
    /// Build the windowed metrics report
    Report {
        /// Window size in days
        #[arg(long, default_value_t = 7)]
        days: i64,
        /// Max tasks included from the window
        #[arg(long, default_value_t = 500)]
        limit_tasks: i64,
        /// Synthetic-traffic update-id floor (smoke/chaos probes)
        #[arg(long, default_value_t = 900_000_000)]
        synthetic_floor: i64,
        /// Write the JSON report to a file as well as stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

pub async fn run(config: &DbConfig, command: MetricsCommands, json: bool) -> anyhow::Result<()> {
    let MetricsCommands::Report {
        days,
        limit_tasks,
        synthetic_floor,
        output: output_path,
    } = command;

    let db = pool::open(config).await?;
    let plane = PlaneConfig::from_env();
    let audit_log = plane
        .storage_root
        .join("memory")
        .join("telegram_command_audit.jsonl");

    let opts = MetricsOptions {
        window_days: days,
        limit_tasks,
        synthetic_update_id_floor: synthetic_floor,
        ..MetricsOptions::default()
    };
    let report = build_report(&db, &plane, &audit_log, &opts).await?;

    if let Some(path) = &output_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        eprintln!("wrote metrics report: {}", path.display());
    }

    output::emit(&report, json, |r| {
        format!(
            "window={}d tasks={} policy_blocks={} gate_pass_rate={} chat_success_rate={} recovery_rate={}",
            days,
            r.task_flow.task_count,
            r.policy.policy_block_count,
            r.review_gate.gate_pass_rate,
            r.chat.success_rate,
            r.chat.incident_recovery_rate
        )
    })
}
