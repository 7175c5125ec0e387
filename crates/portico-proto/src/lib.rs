//! Wire protocol for the portico control channel
//!
//! Everything that crosses the control connection between a portico client
//! and server is a [`Frame`], encoded with bincode behind a 4-byte length
//! prefix by [`FrameCodec`].

pub mod codec;
pub mod ids;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use messages::{Frame, Protocol, ProtocolParseError};

/// Default port for client control connections.
pub const DEFAULT_CONTROL_PORT: u16 = 4040;
