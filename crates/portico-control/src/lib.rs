//! Server-side session state
//!
//! Holds the two pieces of shared keyed state the server mutates from
//! multiple tasks: the per-session pending request table and the global
//! public port map.

mod pending_requests;
mod registry;

pub use pending_requests::{PendingError, PendingReply, PendingRequests, DEFAULT_REQUEST_TIMEOUT};
pub use registry::{PortMap, PortMapError};
