//! `marshal ingress` subcommands: run the long-poll loop, inspect or
//! reset the offset cursor.

use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use tracing::info;

use marshal_core::config::PlaneConfig;
use marshal_core::ingress::{self, Ingress, IngressConfig, TelegramTransport};
use marshal_core::router::Router;
use marshal_db::{pool, DbConfig};

#[derive(Subcommand)]
pub enum IngressCommands {
    /// Run the long-poll loop (single instance per node)
    Run,
    /// Print the current offset cursor
    ShowOffset,
    /// Reset the offset cursor to zero
    ResetOffset,
}

pub async fn run(config: &DbConfig, command: IngressCommands, _json: bool) -> anyhow::Result<()> {
    let plane = PlaneConfig::from_env();
    let ingress_config = IngressConfig::from_env(&plane.storage_root)?;

    match command {
        IngressCommands::ShowOffset => {
            println!("{}", ingress::read_offset(&ingress_config.offset_file));
            Ok(())
        }
        IngressCommands::ResetOffset => {
            ingress::write_offset(&ingress_config.offset_file, 0)?;
            println!("offset reset to 0");
            Ok(())
        }
        IngressCommands::Run => {
            let token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
            if token.trim().is_empty() {
                anyhow::bail!("TELEGRAM_BOT_TOKEN is required");
            }

            let db = pool::open(config).await?;
            let cancel = CancellationToken::new();

            let router = Router::with_cancellation(db.clone(), plane, cancel.clone());
            let transport = TelegramTransport::new(token.trim());
            let ingress = Ingress::new(db, router, ingress_config, transport);

            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    signal_cancel.cancel();
                }
            });

            ingress.run(cancel).await?;
            Ok(())
        }
    }
}
