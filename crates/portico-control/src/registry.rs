//! Public port map
//!
//! `public_port -> session_id`. At most one live session may own a public
//! port; registration is the only writer, public listeners read briefly.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

/// Port map errors
#[derive(Debug, Error)]
pub enum PortMapError {
    #[error("public port {0} is already in use by another tunnel")]
    PortInUse(u16),
}

/// Maps public ports to the session that owns them.
#[derive(Clone)]
pub struct PortMap {
    ports: Arc<DashMap<u16, String>>,
}

impl PortMap {
    pub fn new() -> Self {
        Self {
            ports: Arc::new(DashMap::new()),
        }
    }

    /// Claim a public port for a session.
    pub fn register(&self, public_port: u16, session_id: &str) -> Result<(), PortMapError> {
        match self.ports.entry(public_port) {
            Entry::Occupied(_) => Err(PortMapError::PortInUse(public_port)),
            Entry::Vacant(vacant) => {
                vacant.insert(session_id.to_string());
                Ok(())
            }
        }
    }

    /// Release a port, but only if `session_id` still owns it.
    pub fn release(&self, public_port: u16, session_id: &str) {
        self.ports
            .remove_if(&public_port, |_, owner| owner == session_id);
    }

    /// Which session owns a port, if any.
    pub fn lookup(&self, public_port: u16) -> Option<String> {
        self.ports.get(&public_port).map(|e| e.value().clone())
    }

    /// Number of mapped ports.
    pub fn count(&self) -> usize {
        self.ports.len()
    }
}

impl Default for PortMap {
    fn default() -> Self {
        Self::new()
    }
}
