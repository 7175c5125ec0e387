//! TCP origin dispatcher
//!
//! Keeps one origin connection per public socket: `TcpData` frames that
//! share a `socket_id` are written to the same connection, in arrival
//! order, and everything the origin sends back flows out as `TcpResponse`
//! frames for that socket. The connection is dropped when the origin
//! closes; the server side is not notified (best-effort, like public
//! socket closes in the other direction).

use dashmap::DashMap;
use portico_proto::Frame;
use portico_transport::ControlSender;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const READ_CHUNK_SIZE: usize = 8192;

type ConnMap = Arc<DashMap<String, mpsc::UnboundedSender<Vec<u8>>>>;

/// Origin connections for one TCP tunnel, keyed by public `socket_id`.
pub struct TcpOriginPool {
    /// Target address (host:port)
    target: String,
    control: ControlSender,
    conns: ConnMap,
}

impl TcpOriginPool {
    pub fn new(target: String, control: ControlSender) -> Self {
        Self {
            target,
            control,
            conns: Arc::new(DashMap::new()),
        }
    }

    /// Route one inbound chunk to the origin connection for its socket,
    /// dialing the origin on first use.
    pub async fn dispatch(&self, request_id: String, socket_id: String, data: Vec<u8>) {
        let mut data = data;
        if let Some(tx) = self.conns.get(&socket_id) {
            match tx.send(data) {
                Ok(()) => return,
                // The connection task died under us; redial below.
                Err(rejected) => data = rejected.0,
            }
        }
        self.conns.remove(&socket_id);

        let stream = match TcpStream::connect(&self.target).await {
            Ok(stream) => stream,
            Err(e) => {
                // TCP has no error reply path; the chunk is dropped.
                warn!(
                    "Failed to connect to origin {} for socket {}: {}",
                    self.target, socket_id, e
                );
                return;
            }
        };
        debug!("Opened origin connection for socket {}", socket_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(data);
        self.conns.insert(socket_id.clone(), tx.clone());

        tokio::spawn(run_origin_connection(
            stream,
            request_id,
            socket_id,
            rx,
            tx,
            self.control.clone(),
            self.conns.clone(),
        ));
    }

    /// Number of live origin connections.
    pub fn count(&self) -> usize {
        self.conns.len()
    }
}

/// Pump one origin connection in both directions.
///
/// Reply frames echo the `request_id` of the chunk that opened the
/// connection; routing on the server side is by `socket_id`.
#[allow(clippy::too_many_arguments)]
async fn run_origin_connection(
    stream: TcpStream,
    request_id: String,
    socket_id: String,
    mut chunk_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    chunk_tx: mpsc::UnboundedSender<Vec<u8>>,
    control: ControlSender,
    conns: ConnMap,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(data) = chunk_rx.recv().await {
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
                let frame = Frame::TcpResponse {
                    request_id: request_id.clone(),
                    socket_id: socket_id.clone(),
                    data: buf[..n].to_vec(),
                };
                if control.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Only unmap if a redial has not already replaced this connection.
    conns.remove_if(&socket_id, |_, tx| tx.same_channel(&chunk_tx));
    drop(chunk_tx);
    let _ = writer.await;
    debug!("Origin connection for socket {} closed", socket_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_transport::ControlChannel;
    use tokio::net::TcpListener;

    async fn control_pair() -> (ControlSender, portico_transport::ControlReceiver) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(ControlChannel::connect(addr), listener.accept());
        let (server_stream, _) = accepted.unwrap();
        // Keep the peer side alive by leaking its halves into tasks.
        let (peer_tx, mut peer_rx) = ControlChannel::from_stream(server_stream).split();
        tokio::spawn(async move {
            let _peer_tx = peer_tx;
            while peer_rx.recv().await.is_some() {}
        });
        let (tx, rx) = client.unwrap().split();
        (tx, rx)
    }

    #[tokio::test]
    async fn test_chunks_with_same_socket_id_share_one_connection() {
        // Origin that counts connections and echoes nothing.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let accepted = accepted.clone();
            tokio::spawn(async move {
                loop {
                    let (mut socket, _) = origin.accept().await.unwrap();
                    accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tokio::spawn(async move {
                        let mut sink = Vec::new();
                        let _ = socket.read_to_end(&mut sink).await;
                    });
                }
            });
        }

        let (control, _control_rx) = control_pair().await;
        let pool = TcpOriginPool::new(origin_addr.to_string(), control);

        pool.dispatch("id-1".to_string(), "1.2.3.4:1000".to_string(), b"one".to_vec())
            .await;
        pool.dispatch("id-2".to_string(), "1.2.3.4:1000".to_string(), b"two".to_vec())
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_socket_ids_get_distinct_connections() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let accepted = accepted.clone();
            tokio::spawn(async move {
                loop {
                    let (mut socket, _) = origin.accept().await.unwrap();
                    accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tokio::spawn(async move {
                        let mut sink = Vec::new();
                        let _ = socket.read_to_end(&mut sink).await;
                    });
                }
            });
        }

        let (control, _control_rx) = control_pair().await;
        let pool = TcpOriginPool::new(origin_addr.to_string(), control);

        pool.dispatch("id-1".to_string(), "1.2.3.4:1000".to_string(), b"a".to_vec())
            .await;
        pool.dispatch("id-2".to_string(), "1.2.3.4:2000".to_string(), b"b".to_vec())
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(pool.count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_origin_drops_chunk() {
        let (control, _control_rx) = control_pair().await;
        let pool = TcpOriginPool::new("127.0.0.1:1".to_string(), control);

        pool.dispatch("id-1".to_string(), "1.2.3.4:1000".to_string(), b"x".to_vec())
            .await;
        assert_eq!(pool.count(), 0);
    }
}
