use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use streamgate_core::{logging, Config};
use streamgate_hls::HlsStreamer;
use streamgate_porter::Porter;

#[derive(Parser)]
#[command(name = "streamgate", version, about = "Streaming front door and HLS server")]
struct Cli {
    /// Configuration file (TOML); defaults and STREAMGATE_ environment
    /// overrides apply on top
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the public front door that routes connections to backends
    Porter,
    /// Run an HLS streamer backend
    Streamer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;
    logging::init_logging(&config.logging)?;

    match cli.command {
        Command::Porter => {
            let porter = Porter::bind(&config.porter).await?;
            info!(
                socket = %porter.socket_path().display(),
                "porter starting"
            );
            tokio::select! {
                result = porter.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                }
            }
        }
        Command::Streamer => {
            let streamer = HlsStreamer::new(config)?;
            info!("hls streamer starting");
            tokio::select! {
                result = streamer.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                }
            }
        }
    }
    Ok(())
}
