//! fleetctl-daemon - SSH/Docker fleet-management control plane
//!
//! Registers remote machines, executes commands and container operations
//! over cached SSH sessions, probes each machine's health on a schedule,
//! evaluates alert rules over the resulting metrics, and dispatches
//! notifications, all behind a bearer-token-gated HTTP API.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "fleetctl-daemon")]
#[command(about = "Fleet-management control plane for SSH/Docker hosts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fleetctl_daemon={log_level}").into()),
        )
        .init();

    info!("Starting fleetctl-daemon v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run(&cli.config).await?;
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("Daemon error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
