//! Portico server binary - public side of the reverse tunnel

use anyhow::{Context, Result};
use clap::Parser;
use portico_server::{Server, ServerConfig, DEFAULT_CONTROL_PORT};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portico server - exposes tunnel clients on public ports
#[derive(Parser, Debug)]
#[command(name = "portico-server")]
#[command(about = "Portico server - exposes tunnel clients on public ports")]
#[command(version)]
struct Args {
    /// Port for client control connections
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Hostname advertised in public tunnel URLs
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Reply deadline for tunneled HTTP requests, in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,

    /// High-water mark for in-flight requests per session
    #[arg(long, default_value_t = 1024)]
    max_pending: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = ServerConfig {
        control_port: args.control_port,
        host: args.host,
        request_timeout: Duration::from_secs(args.request_timeout),
        max_pending: args.max_pending,
    };

    let server = Server::bind(config)
        .await
        .context("failed to start server")?;

    // Ctrl-C flips the shutdown watch; run() drains live sessions before
    // returning.
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await.context("server terminated")?;

    Ok(())
}
