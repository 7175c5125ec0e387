//! Portico client
//!
//! Runs next to a private service, keeps a control connection to a portico
//! server, and relays tunneled traffic to and from the local origin. On
//! control-channel loss the client waits out a back-off and redials; no
//! request state survives reconnection.

mod config;
mod dispatcher;
mod http_origin;
mod reconnect;
mod tcp_origin;

pub use config::ClientConfig;
pub use http_origin::{HttpOrigin, OriginError};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use tcp_origin::TcpOriginPool;

use portico_transport::ChannelError;
use thiserror::Error;
use tracing::{info, warn};

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("control channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("control connection closed before registration completed")]
    ConnectionClosed,

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// Run the client: connect, register, relay frames; redial on loss.
///
/// Returns only on an unrecoverable error. A rejected registration is
/// unrecoverable (retrying the same parameters would be rejected again);
/// transport loss is not.
pub async fn run(config: ClientConfig) -> Result<(), ClientError> {
    let mut reconnect = ReconnectManager::new(config.reconnect.clone());

    loop {
        match dispatcher::run_session(&config).await {
            Ok(()) => {
                warn!("Control channel closed");
                reconnect.reset();
            }
            Err(e @ ClientError::Rejected(_)) => return Err(e),
            Err(e) => {
                warn!("Session failed: {}", e);
            }
        }

        reconnect.wait().await?;
        info!("Reconnecting (attempt {})", reconnect.attempt());
    }
}
