//! vmux CLI
//!
//! Echo server and client for virtual connections multiplexed over a
//! single TCP connection.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmux_cli::{commands, load_cli_config};

#[derive(Parser)]
#[command(name = "vmux")]
#[command(author, version, about = "Virtual connections multiplexed over one TCP stream")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log level (error, warn, info, debug, trace); overrides -v
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server for virtual connections
    Serve {
        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Send a message over concurrent virtual connections and print the echoes
    Send {
        /// Server address (overrides config)
        #[arg(long)]
        connect: Option<String>,
        /// Number of virtual connections to open
        #[arg(short = 'n', long, default_value_t = 1)]
        streams: usize,
        /// Message to send on every connection
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.log_level.as_deref(), cli.verbose) {
        (Some(level), _) => level,
        (None, 0) => "warn",
        (None, 1) => "info",
        (None, 2) => "debug",
        (None, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_cli_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            let bind_addr = bind.unwrap_or_else(|| config.bind_address.clone());
            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone());
            commands::serve_command(&bind_addr, config.mux, cancel).await
        }
        Commands::Send {
            connect,
            streams,
            message,
        } => {
            let connect_addr = connect.unwrap_or_else(|| config.connect_address.clone());
            commands::send_command(&connect_addr, config.mux, streams, &message).await
        }
    }
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
