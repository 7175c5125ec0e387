//! Pending requests tracker
//!
//! Tracks public requests sent through a tunnel and routes replies back to
//! the task awaiting them. Every entry carries a deadline: a reply that has
//! not arrived when it fires is completed as [`PendingReply::TimedOut`] and
//! removed, so an id is present here iff a public caller is still waiting.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portico_proto::Frame;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default deadline for an in-flight request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a pending entry was completed.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingReply {
    /// The client's reply frame arrived in time.
    Reply(Frame),
    /// The deadline fired first; the public caller gets 504.
    TimedOut,
    /// The session went away first; the public caller gets 502.
    SessionClosed,
}

/// Pending table errors
#[derive(Debug, Error)]
pub enum PendingError {
    #[error("request id '{0}' is already in flight")]
    DuplicateId(String),
}

/// Tracks pending requests awaiting replies from the tunnel client.
#[derive(Clone)]
pub struct PendingRequests {
    /// Maps request_id -> oneshot sender for the reply
    requests: Arc<DashMap<String, oneshot::Sender<PendingReply>>>,
    timeout: Duration,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Register a new pending request.
    ///
    /// Fails if the id is already in flight. Starts the deadline timer for
    /// the entry; the returned receiver always resolves to exactly one
    /// [`PendingReply`] (reply, timeout, or drain), never hangs.
    pub fn register(&self, request_id: &str) -> Result<oneshot::Receiver<PendingReply>, PendingError> {
        let (tx, rx) = oneshot::channel();
        match self.requests.entry(request_id.to_string()) {
            Entry::Occupied(_) => return Err(PendingError::DuplicateId(request_id.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(tx);
            }
        }
        debug!("Registered pending request {}", request_id);

        let requests = self.requests.clone();
        let id = request_id.to_string();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, tx)) = requests.remove(&id) {
                debug!("Pending request {} timed out after {:?}", id, timeout);
                let _ = tx.send(PendingReply::TimedOut);
            }
        });

        Ok(rx)
    }

    /// Deliver a reply frame for a pending request.
    ///
    /// Returns true if it was delivered, false if the id was not found
    /// (late reply after timeout or drain: dropped silently).
    pub fn respond(&self, request_id: &str, reply: Frame) -> bool {
        if let Some((_, tx)) = self.requests.remove(request_id) {
            debug!("Routing reply for request {}", request_id);
            if tx.send(PendingReply::Reply(reply)).is_err() {
                warn!("Reply receiver for request {} dropped", request_id);
                return false;
            }
            return true;
        }
        debug!("Dropping reply for unknown request {}", request_id);
        false
    }

    /// Cancel a pending request without completing it.
    pub fn cancel(&self, request_id: &str) {
        if self.requests.remove(request_id).is_some() {
            debug!("Cancelled pending request {}", request_id);
        }
    }

    /// Complete every remaining entry with `reason` (session teardown).
    pub fn drain(&self, reason: PendingReply) {
        let ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.requests.remove(&id) {
                let _ = tx.send(reason.clone());
            }
        }
    }

    /// Number of in-flight requests.
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
