//! Tunnel session handling
//!
//! One session per control connection. A session starts in the registration
//! phase (the first meaningful frame must be `Register`), then relays frames
//! until the transport closes, then tears down: listener stopped, pendings
//! drained with a gateway error, public port released.

use crate::tcp_public::SocketRegistry;
use crate::{http_public, tcp_public, ServerConfig};
use portico_control::{PendingReply, PendingRequests, PortMap};
use portico_proto::{ids, Frame, Protocol};
use portico_transport::{ControlChannel, ControlSender};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-session state shared with the public listeners.
pub struct SessionHandle {
    pub id: String,
    pub sender: ControlSender,
    pub pending: PendingRequests,
    pub sockets: SocketRegistry,
}

/// Drive one control connection from accept to teardown.
///
/// The session ends when the transport closes or when server shutdown is
/// signalled; both paths run the same teardown.
pub(crate) async fn handle_control_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: ServerConfig,
    port_map: PortMap,
    mut shutdown: watch::Receiver<bool>,
) {
    let session_id = ids::session_id();
    info!("New control connection from {} (session {})", peer_addr, session_id);

    let channel = ControlChannel::from_stream(stream);
    let (sender, mut receiver) = channel.split();

    let session = Arc::new(SessionHandle {
        id: session_id.clone(),
        sender: sender.clone(),
        pending: PendingRequests::with_timeout(config.request_timeout),
        sockets: SocketRegistry::new(),
    });

    // Registration phase: wait for a Register frame that we can satisfy.
    // A rejected attempt (port collision, bind failure) leaves the session
    // open for another try.
    let mut registered: Option<(u16, JoinHandle<()>)> = None;
    while registered.is_none() {
        let frame = tokio::select! {
            frame = receiver.recv() => match frame {
                Some(frame) => frame,
                None => {
                    info!("Session {} closed before registration", session_id);
                    return;
                }
            },
            _ = shutdown.changed() => {
                info!("Session {} dropped for server shutdown", session_id);
                sender.close();
                return;
            }
        };

        let Frame::Register {
            local_port,
            public_port,
            protocol,
        } = frame
        else {
            debug!("Session {} sent a non-Register frame before registration, ignoring", session_id);
            continue;
        };

        match register_tunnel(&session, &config, &port_map, public_port, protocol).await {
            Ok(listener_task) => {
                let public_url = format!("{}://{}:{}", protocol, config.host, public_port);
                info!(
                    "Session {} registered: {} -> localhost:{} ({})",
                    session_id, public_url, local_port, protocol
                );

                let confirmation = Frame::Registered {
                    session_id: session_id.clone(),
                    local_port,
                    public_port,
                    protocol,
                    public_url,
                };
                if sender.send(confirmation).await.is_err() {
                    warn!("Session {} vanished while confirming registration", session_id);
                    listener_task.abort();
                    port_map.release(public_port, &session_id);
                    return;
                }

                registered = Some((public_port, listener_task));
            }
            Err(message) => {
                warn!("Session {} registration rejected: {}", session_id, message);
                let _ = sender.send(Frame::Error { message }).await;
            }
        }
    }
    let (public_port, listener_task) = registered.expect("registration loop exits with a tunnel");

    // Relay phase: route replies until the transport closes or the server
    // shuts down.
    loop {
        let frame = tokio::select! {
            frame = receiver.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.changed() => {
                info!("Session {} closing for server shutdown", session_id);
                break;
            }
        };
        match frame {
            Frame::HttpResponse { ref request_id, .. } => {
                let request_id = request_id.clone();
                // Late replies (after timeout or drain) are dropped silently.
                session.pending.respond(&request_id, frame);
            }
            Frame::TcpResponse {
                socket_id, data, ..
            } => {
                if !session.sockets.write(&socket_id, data) {
                    debug!(
                        "Session {}: dropping TcpResponse for closed socket {}",
                        session_id, socket_id
                    );
                }
            }
            Frame::Register { .. } => {
                warn!("Session {} attempted to re-register", session_id);
                let _ = sender
                    .send(Frame::Error {
                        message: "session already has a registered tunnel".to_string(),
                    })
                    .await;
            }
            other => {
                debug!("Session {}: ignoring unexpected frame {:?}", session_id, other);
            }
        }
    }

    // Teardown.
    listener_task.abort();
    session.sockets.clear();
    session.pending.drain(PendingReply::SessionClosed);
    port_map.release(public_port, &session_id);
    sender.close();
    info!(
        "Session {} closed, public port {} released",
        session_id, public_port
    );
}

/// Claim the public port, bind its listener, and start serving.
///
/// The bind happens synchronously here so a `Registered` confirmation is
/// never sent for a port we could not actually open.
async fn register_tunnel(
    session: &Arc<SessionHandle>,
    config: &ServerConfig,
    port_map: &PortMap,
    public_port: u16,
    protocol: Protocol,
) -> Result<JoinHandle<()>, String> {
    port_map
        .register(public_port, &session.id)
        .map_err(|e| e.to_string())?;

    let listener = match TcpListener::bind(("0.0.0.0", public_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            port_map.release(public_port, &session.id);
            return Err(format!("failed to bind public port {}: {}", public_port, e));
        }
    };

    let task = match protocol {
        Protocol::Http => tokio::spawn(http_public::serve(
            listener,
            session.clone(),
            config.max_pending,
        )),
        Protocol::Tcp => tokio::spawn(tcp_public::serve(listener, session.clone())),
    };
    Ok(task)
}
