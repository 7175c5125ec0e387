//! Portico server
//!
//! Accepts control connections from tunnel clients, negotiates one tunnel
//! per session, and exposes each tunnel on its requested public port. The
//! server owns the public listeners; the client owns the origin connections;
//! the control channel is the only link between them.

mod http_public;
mod session;
mod tcp_public;

pub use session::SessionHandle;
pub use tcp_public::SocketRegistry;

use portico_control::PortMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

pub use portico_proto::DEFAULT_CONTROL_PORT;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind control port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the control listener binds on.
    pub control_port: u16,
    /// Hostname advertised in public tunnel URLs.
    pub host: String,
    /// Reply deadline for tunneled HTTP requests.
    pub request_timeout: Duration,
    /// High-water mark for in-flight requests per session; beyond it new
    /// public requests are rejected with 503.
    pub max_pending: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            host: "localhost".to_string(),
            request_timeout: portico_control::DEFAULT_REQUEST_TIMEOUT,
            max_pending: 1024,
        }
    }
}

/// Asks a running [`Server`] to shut down.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Stop accepting and close every live session. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The portico server: one control listener plus the global port map.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    port_map: PortMap,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Bind the control listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", config.control_port))
            .await
            .map_err(|source| ServerError::Bind {
                port: config.control_port,
                source,
            })?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            listener,
            port_map: PortMap::new(),
            shutdown_tx,
        })
    }

    /// The bound control address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn port_map(&self) -> &PortMap {
        &self.port_map
    }

    /// Handle for signalling shutdown from outside [`Server::run`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept control connections until shutdown is signalled, then wait
    /// for every live session to finish its teardown (pendings drained,
    /// listeners stopped, ports released).
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            "Control listener on {} (public host: {})",
            self.listener.local_addr()?,
            self.config.host
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let config = self.config.clone();
                        let port_map = self.port_map.clone();
                        let shutdown = self.shutdown_tx.subscribe();
                        sessions.spawn(session::handle_control_connection(
                            stream, peer_addr, config, port_map, shutdown,
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                    }
                },
                // Reap finished session tasks as they go.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        info!(
            "Control listener stopped, waiting for {} live sessions",
            sessions.len()
        );
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}
