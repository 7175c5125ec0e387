//! Frame dispatch for one connected session
//!
//! Registers the tunnel, then consumes inbound frames from the control
//! channel: HTTP requests fan out to concurrent origin calls, TCP chunks
//! route through the per-socket connection pool. Anything else is ignored
//! for forward compatibility.

use crate::config::ClientConfig;
use crate::http_origin::HttpOrigin;
use crate::tcp_origin::TcpOriginPool;
use crate::ClientError;
use portico_proto::Frame;
use portico_transport::ControlChannel;
use tracing::{debug, info, warn};

/// Connect, register, and relay frames until the channel closes.
///
/// `Ok(())` means the session was registered and later lost (redial);
/// errors mean the session never became useful.
pub(crate) async fn run_session(config: &ClientConfig) -> Result<(), ClientError> {
    let control_addr = config.control_addr();
    info!("Connecting to {}", control_addr);

    let channel = ControlChannel::connect(control_addr).await?;
    let (sender, mut receiver) = channel.split();

    sender
        .send(Frame::Register {
            local_port: config.local_port,
            public_port: config.public_port,
            protocol: config.protocol,
        })
        .await?;

    // Await the server's verdict.
    let (session_id, public_url) = loop {
        match receiver.recv().await {
            Some(Frame::Registered {
                session_id,
                public_url,
                ..
            }) => break (session_id, public_url),
            Some(Frame::Error { message }) => return Err(ClientError::Rejected(message)),
            Some(other) => {
                debug!("Ignoring frame before registration: {:?}", other);
            }
            None => return Err(ClientError::ConnectionClosed),
        }
    };

    info!(
        "🚇 Tunnel up: {} -> localhost:{} (session {})",
        public_url, config.local_port, session_id
    );

    let http_origin = HttpOrigin::new(config.local_addr());
    let tcp_origin = TcpOriginPool::new(config.local_addr(), sender.clone());

    while let Some(frame) = receiver.recv().await {
        match frame {
            Frame::HttpRequest {
                request_id,
                method,
                path_and_query,
                headers,
                body,
            } => {
                // Each request runs concurrently; replies interleave on the
                // wire at frame granularity.
                let origin = http_origin.clone();
                let sender = sender.clone();
                tokio::spawn(async move {
                    let reply = origin
                        .forward(&request_id, &method, &path_and_query, &headers, body)
                        .await;
                    if sender.send(reply).await.is_err() {
                        debug!(
                            "Channel closed before reply for request {} could be sent",
                            request_id
                        );
                    }
                });
            }
            Frame::TcpData {
                request_id,
                socket_id,
                data,
            } => {
                tcp_origin.dispatch(request_id, socket_id, data).await;
            }
            Frame::Error { message } => {
                warn!("Server error: {}", message);
            }
            other => {
                debug!("Ignoring unexpected frame: {:?}", other);
            }
        }
    }

    Ok(())
}
