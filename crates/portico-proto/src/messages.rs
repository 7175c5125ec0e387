//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One record on the control channel.
///
/// Headers are carried as an ordered list of name/value pairs so that
/// multi-valued headers (`Set-Cookie` and friends) survive the trip intact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    /// Client asks the server to expose `public_port` for its local service.
    Register {
        local_port: u16,
        public_port: u16,
        protocol: Protocol,
    },
    /// Server confirms the tunnel is up.
    Registered {
        session_id: String,
        local_port: u16,
        public_port: u16,
        protocol: Protocol,
        public_url: String,
    },
    /// The pending operation failed; the session stays open.
    Error { message: String },
    /// One buffered public HTTP request, server -> client.
    HttpRequest {
        request_id: String,
        method: String,
        path_and_query: String,
        headers: Vec<(String, String)>,
        #[serde(with = "serde_bytes_option")]
        body: Option<Vec<u8>>,
    },
    /// The origin's reply for `request_id`, client -> server.
    ///
    /// A non-`None` `error` means the origin call failed; the server turns
    /// it into a 502 regardless of `status`.
    HttpResponse {
        request_id: String,
        status: u16,
        headers: Vec<(String, String)>,
        #[serde(with = "serde_bytes_option")]
        body: Option<Vec<u8>>,
        error: Option<String>,
    },
    /// One chunk read from a public TCP socket, server -> client.
    TcpData {
        request_id: String,
        socket_id: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// One chunk read from the origin, client -> server.
    TcpResponse {
        request_id: String,
        socket_id: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

impl Frame {
    /// The correlation id carried by this frame, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Frame::HttpRequest { request_id, .. }
            | Frame::HttpResponse { request_id, .. }
            | Frame::TcpData { request_id, .. }
            | Frame::TcpResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

// Custom serde helpers for byte payloads
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

mod serde_bytes_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&bytes),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<Vec<u8>>::deserialize(deserializer)
    }
}

/// Tunnel protocol shape
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Protocol {
    /// Request/response HTTP with buffered bodies
    Http,
    /// Opaque byte streams
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown protocol '{0}', expected 'http' or 'tcp'")]
pub struct ProtocolParseError(String);

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(ProtocolParseError(other.to_string())),
        }
    }
}
