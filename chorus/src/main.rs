use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use chorus_client::Config;

#[derive(Parser)]
#[command(name = "chorus", about = "Distributed validator middleware")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an operator node.
    Run {
        /// Path to the node's TOML configuration.
        #[arg(long, default_value = "chorus.toml")]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            let config = match Config::from_file(&config) {
                Ok(config) => config,
                Err(err) => {
                    error!(%err, "Failed loading configuration");
                    return ExitCode::FAILURE;
                }
            };

            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(%err, "Failed starting runtime");
                    return ExitCode::FAILURE;
                }
            };

            runtime.block_on(async move {
                let shutdown = CancellationToken::new();

                let signal_token = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received shutdown signal");
                        signal_token.cancel();
                    }
                });

                match chorus_client::run(config, shutdown).await {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(err) => {
                        error!(%err, "Node failed");
                        ExitCode::FAILURE
                    }
                }
            })
        }
    }
}
