//! Portico client binary - expose a local service through a portico server

use anyhow::{Context, Result};
use clap::Parser;
use portico_client::{ClientConfig, ReconnectConfig};
use portico_proto::Protocol;
use tokio::net::TcpStream;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portico - expose a local service through a portico server
#[derive(Parser, Debug)]
#[command(name = "portico")]
#[command(about = "Expose a local service through a portico server")]
#[command(version)]
struct Args {
    /// Local port to expose
    #[arg(value_name = "PORT")]
    port: Option<u16>,

    /// Local port to expose (overrides the positional argument)
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    /// Public port to request on the server
    #[arg(short = 's', long, default_value_t = 5000)]
    server_port: u16,

    /// Tunnel protocol (http or tcp)
    #[arg(short = 'p', long, default_value = "http")]
    protocol: String,

    /// Server hostname
    #[arg(long, default_value = "localhost")]
    server_host: String,

    /// Server control port
    #[arg(long, default_value_t = portico_proto::DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    // Validated here rather than through clap so a bad protocol exits 1.
    let protocol: Protocol = match args.protocol.parse() {
        Ok(protocol) => protocol,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let local_port = args.local_port.or(args.port).unwrap_or(3000);

    // Precondition: the local service must be reachable before we register.
    if TcpStream::connect(("127.0.0.1", local_port)).await.is_err() {
        error!("No service reachable on localhost:{}", local_port);
        std::process::exit(1);
    }

    let config = ClientConfig {
        local_port,
        public_port: args.server_port,
        protocol,
        server_host: args.server_host,
        control_port: args.control_port,
        reconnect: ReconnectConfig::default(),
    };

    tokio::select! {
        result = portico_client::run(config) => {
            result.context("tunnel client terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
    }

    Ok(())
}
