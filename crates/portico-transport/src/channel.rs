//! Control channel over a framed TCP stream

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use portico_proto::{Frame, FrameCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Control channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control channel closed")]
    Closed,
}

/// One control connection, before it is split into halves.
pub struct ControlChannel {
    framed: Framed<TcpStream, FrameCodec>,
    peer_addr: Option<SocketAddr>,
}

impl ControlChannel {
    /// Dial a server control port.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an accepted connection.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            framed: Framed::new(stream, FrameCodec),
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Split into a cloneable sender and a receive half.
    ///
    /// All frames funnel through one writer task that owns the sink, so
    /// concurrent senders never interleave bytes mid-frame and submission
    /// order is preserved per sender.
    pub fn split(self) -> (ControlSender, ControlReceiver) {
        let (sink, stream) = self.framed.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(64);
        let (close_tx, close_rx) = watch::channel(false);
        let close_tx = Arc::new(close_tx);

        tokio::spawn(write_loop(sink, frame_rx, close_rx.clone()));

        let sender = ControlSender {
            tx: frame_tx,
            close: close_tx.clone(),
        };
        let receiver = ControlReceiver {
            stream,
            close: close_tx,
            close_rx,
        };
        (sender, receiver)
    }
}

async fn write_loop(
    mut sink: SplitSink<Framed<TcpStream, FrameCodec>, Frame>,
    mut frame_rx: mpsc::Receiver<Frame>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
            }
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            debug!("control channel write failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    // Flush and shut down the write half so the peer sees an orderly close.
    let _ = sink.close().await;
}

/// Cloneable send half of a control channel.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Frame>,
    close: Arc<watch::Sender<bool>>,
}

impl ControlSender {
    /// Queue one frame for the writer task.
    ///
    /// Fails once the channel is closed; a frame accepted here may still be
    /// lost if the transport dies before the writer drains it.
    pub async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        self.tx.send(frame).await.map_err(|_| ChannelError::Closed)
    }

    /// Close the channel. Idempotent; pending sends fail and the peer's
    /// receive half terminates.
    pub fn close(&self) {
        let _ = self.close.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow() || self.tx.is_closed()
    }
}

/// Receive half of a control channel.
pub struct ControlReceiver {
    stream: SplitStream<Framed<TcpStream, FrameCodec>>,
    close: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
}

impl ControlReceiver {
    /// Receive the next inbound frame.
    ///
    /// Returns `None` on orderly close, on [`ControlSender::close`], or on a
    /// decode failure (which is fatal for the session).
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            tokio::select! {
                changed = self.close_rx.changed() => {
                    if changed.is_err() || *self.close_rx.borrow() {
                        return None;
                    }
                }
                item = self.stream.next() => {
                    return match item {
                        Some(Ok(frame)) => Some(frame),
                        Some(Err(e)) => {
                            warn!("control channel decode failed, closing: {}", e);
                            let _ = self.close.send(true);
                            None
                        }
                        None => {
                            let _ = self.close.send(true);
                            None
                        }
                    };
                }
            }
        }
    }

    /// Close the channel from the receive side. Idempotent.
    pub fn close(&self) {
        let _ = self.close.send(true);
    }
}
