//! Driftnet CLI - Command-line interface
//!
//! Downloads single-file torrents and inspects torrent metadata.

mod commands;

use clap::Parser;
use driftnet_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "driftnet")]
#[command(about = "A BitTorrent piece exchange client")]
struct Cli {
    /// Console log level; the full trace always goes to logs/
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    commands::handle_command(cli.command).await
}
