//! Framed control channel between portico client and server
//!
//! Wraps one duplex TCP connection into a send/receive pair of [`Frame`]
//! values. Writes from concurrent senders are serialized through a single
//! writer task so frames never interleave on the wire.

mod channel;

pub use channel::{ChannelError, ControlChannel, ControlReceiver, ControlSender};
