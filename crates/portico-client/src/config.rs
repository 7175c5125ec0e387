//! Client configuration

use crate::reconnect::ReconnectConfig;
use portico_proto::Protocol;

/// Default port for the local service.
pub const DEFAULT_LOCAL_PORT: u16 = 3000;

/// Default public port to request on the server.
pub const DEFAULT_PUBLIC_PORT: u16 = 5000;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Port of the local service to expose.
    pub local_port: u16,
    /// Public port to request on the server.
    pub public_port: u16,
    /// Tunnel protocol.
    pub protocol: Protocol,
    /// Server hostname.
    pub server_host: String,
    /// Server control port.
    pub control_port: u16,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_port: DEFAULT_LOCAL_PORT,
            public_port: DEFAULT_PUBLIC_PORT,
            protocol: Protocol::Http,
            server_host: "localhost".to_string(),
            control_port: portico_proto::DEFAULT_CONTROL_PORT,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Address of the server's control listener.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.control_port)
    }

    /// Address of the local origin service.
    pub fn local_addr(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }
}
