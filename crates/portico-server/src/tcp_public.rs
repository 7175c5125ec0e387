//! Public TCP listener and socket registry
//!
//! Each accepted public connection is keyed by its peer `addr:port`
//! (`socket_id`). Inbound chunks become `TcpData` frames; `TcpResponse`
//! frames are demultiplexed back to the live socket by `socket_id`. Closing
//! a public socket does not notify the client; cleanup is best-effort.

use crate::session::SessionHandle;
use dashmap::DashMap;
use portico_proto::{ids, Frame};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error};

const READ_CHUNK_SIZE: usize = 8192;

/// Live public sockets for one TCP tunnel, keyed by `socket_id`.
#[derive(Clone)]
pub struct SocketRegistry {
    sockets: Arc<DashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            sockets: Arc::new(DashMap::new()),
        }
    }

    fn insert(&self, socket_id: &str, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.sockets.insert(socket_id.to_string(), tx);
    }

    fn remove(&self, socket_id: &str) {
        self.sockets.remove(socket_id);
    }

    /// Queue reply bytes for a live socket. Returns false if the socket is
    /// gone (the chunk is dropped).
    pub fn write(&self, socket_id: &str, data: Vec<u8>) -> bool {
        match self.sockets.get(socket_id) {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Drop every socket writer; their tasks flush and close.
    pub fn clear(&self) {
        self.sockets.clear();
    }

    pub fn count(&self) -> usize {
        self.sockets.len()
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept public TCP connections for one tunnel.
pub(crate) async fn serve(listener: TcpListener, session: Arc<SessionHandle>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let socket_id = peer_addr.to_string();
                debug!("Session {}: public TCP connection {}", session.id, socket_id);

                let (tx, rx) = mpsc::unbounded_channel();
                session.sockets.insert(&socket_id, tx);

                let session = session.clone();
                tokio::spawn(handle_public_socket(socket, socket_id, rx, session));
            }
            Err(e) => {
                error!("Failed to accept public TCP connection: {}", e);
            }
        }
    }
}

async fn handle_public_socket(
    socket: TcpStream,
    socket_id: String,
    mut reply_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    session: Arc<SessionHandle>,
) {
    let (mut read_half, mut write_half) = socket.into_split();

    let writer = tokio::spawn(async move {
        while let Some(data) = reply_rx.recv().await {
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = Frame::TcpData {
                    request_id: ids::request_id(),
                    socket_id: socket_id.clone(),
                    data: buf[..n].to_vec(),
                };
                if session.sender.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Removing the registry entry drops the reply sender, which lets the
    // writer drain whatever is already queued and close.
    session.sockets.remove(&socket_id);
    let _ = writer.await;
    debug!("Session {}: public TCP connection {} closed", session.id, socket_id);
}
