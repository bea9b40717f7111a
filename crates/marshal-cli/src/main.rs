mod ingress_cmd;
mod metrics_cmd;
mod output;
mod registry_cmd;
mod router_cmd;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use marshal_db::DbConfig;

use ingress_cmd::IngressCommands;
use metrics_cmd::MetricsCommands;
use registry_cmd::RegistryCommands;
use router_cmd::RouterCommands;

#[derive(Parser)]
#[command(name = "marshal", about = "Supervised control plane for a two-tier worker fleet")]
struct Cli {
    /// SQLite database path (overrides ZHC_TASK_DB)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Emit structured JSON instead of human line summaries
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Task registry operations
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    /// Router operations: classify, route, gate artifacts, approve, resume
    Router {
        #[command(subcommand)]
        command: RouterCommands,
    },
    /// Long-poll chat ingress
    Ingress {
        #[command(subcommand)]
        command: IngressCommands,
    },
    /// Operational metrics reports
    Metrics {
        #[command(subcommand)]
        command: MetricsCommands,
    },
}

fn db_config(cli: &Cli) -> DbConfig {
    match &cli.db {
        Some(path) => DbConfig::new(path),
        None => DbConfig::from_env(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = db_config(&cli);
    match cli.command {
        Commands::Registry { command } => registry_cmd::run(&config, command, cli.json).await,
        Commands::Router { command } => router_cmd::run(&config, command, cli.json).await,
        Commands::Ingress { command } => ingress_cmd::run(&config, command, cli.json).await,
        Commands::Metrics { command } => metrics_cmd::run(&config, command, cli.json).await,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("ERROR: {e:#}");
        std::process::exit(1);
    }
}
