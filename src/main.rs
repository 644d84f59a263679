//! rdphost CLI - RDP session server
//!
//! Loads `RDP_*` settings from the environment or an env-style file and
//! serves RDP sessions until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use rdphost::{RdpError, RdpServer, ServerConfig};

/// rdphost - RDP session server
#[derive(Parser, Debug)]
#[command(name = "rdphost")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Env-style configuration file (defaults to the process environment)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host (overrides RDP_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides RDP_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), RdpError> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            ServerConfig::from_file(path)?
        }
        None => ServerConfig::from_env()?,
    };

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    tracing::info!(
        "rdphost {} starting (encryption level {})",
        env!("CARGO_PKG_VERSION"),
        config.encryption_level.as_str()
    );

    let server = RdpServer::bind(config).await?;
    run_with_cleanup(&server).await
}

/// Serve until Ctrl+C or SIGTERM, then disconnect every session
async fn run_with_cleanup(server: &RdpServer) -> Result<(), RdpError> {
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
        result = server.run() => {
            return result;
        }
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    server.shutdown().await;
    let stats = server.registry().snapshot();
    tracing::info!(
        "Served {} connections ({} rejected), {} packets in / {} out",
        stats.connections_total,
        stats.connections_rejected,
        stats.packets_received,
        stats.packets_sent
    );
    Ok(())
}
