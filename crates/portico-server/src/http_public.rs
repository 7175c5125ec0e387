//! Public HTTP listener and request multiplexer
//!
//! Each inbound request is buffered, framed as `HttpRequest` with a fresh
//! correlation id, and sent down the control channel; the handler then parks
//! on the pending table until the reply, the deadline, or session teardown
//! completes it. Distinct requests interleave freely on the wire.

use crate::session::SessionHandle;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use portico_control::{PendingError, PendingReply};
use portico_proto::{ids, Frame};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

/// Accept public HTTP connections for one tunnel.
pub(crate) async fn serve(listener: TcpListener, session: Arc<SessionHandle>, max_pending: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let session = session.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let session = session.clone();
                        async move { handle_request(session, peer_addr, max_pending, req).await }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Public HTTP connection error from {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept public HTTP connection: {}", e);
            }
        }
    }
}

/// Forward one public request through the tunnel and await its reply.
async fn handle_request(
    session: Arc<SessionHandle>,
    peer_addr: SocketAddr,
    max_pending: usize,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if session.pending.count() >= max_pending {
        return Ok(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "tunnel is at capacity",
        ));
    }

    let method = req.method().as_str().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    // Preserve header order and multiplicity; folding multi-valued headers
    // would corrupt cookies.
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut original_host = None;
    for (name, value) in req.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        if name == hyper::header::HOST {
            original_host = Some(value.clone());
        }
        headers.push((name.as_str().to_string(), value));
    }
    headers.push(("x-forwarded-for".to_string(), peer_addr.ip().to_string()));
    headers.push(("x-forwarded-proto".to_string(), "http".to_string()));
    if let Some(host) = original_host {
        headers.push(("x-forwarded-host".to_string(), host));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            if bytes.is_empty() {
                None
            } else {
                Some(bytes.to_vec())
            }
        }
        Err(e) => {
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {}", e),
            ));
        }
    };

    // Fresh correlation id, retrying the rare collision.
    let (request_id, reply_rx) = loop {
        let id = ids::request_id();
        match session.pending.register(&id) {
            Ok(rx) => break (id, rx),
            Err(PendingError::DuplicateId(_)) => continue,
        }
    };

    debug!(
        "Session {}: forwarding {} {} as request {}",
        session.id, method, path_and_query, request_id
    );

    let frame = Frame::HttpRequest {
        request_id: request_id.clone(),
        method,
        path_and_query,
        headers,
        body,
    };
    if session.sender.send(frame).await.is_err() {
        session.pending.cancel(&request_id);
        return Ok(text_response(StatusCode::BAD_GATEWAY, "tunnel session closed"));
    }

    match reply_rx.await {
        Ok(PendingReply::Reply(Frame::HttpResponse {
            status,
            headers,
            body,
            error,
            ..
        })) => {
            if let Some(message) = error {
                return Ok(text_response(StatusCode::BAD_GATEWAY, message));
            }
            Ok(tunnel_response(status, headers, body))
        }
        Ok(PendingReply::Reply(other)) => {
            warn!(
                "Session {}: unexpected reply frame for request {}: {:?}",
                session.id, request_id, other
            );
            Ok(text_response(StatusCode::BAD_GATEWAY, "unexpected tunnel reply"))
        }
        Ok(PendingReply::TimedOut) => Ok(text_response(
            StatusCode::GATEWAY_TIMEOUT,
            "tunnel request timed out",
        )),
        Ok(PendingReply::SessionClosed) | Err(_) => {
            Ok(text_response(StatusCode::BAD_GATEWAY, "tunnel session closed"))
        }
    }
}

/// Translate a tunnel reply into the public HTTP response.
fn tunnel_response(
    status: u16,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        // The body is re-buffered here, so framing headers from the origin
        // no longer apply.
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    let body = Full::new(body.map(Bytes::from).unwrap_or_default());
    builder.body(body).unwrap_or_else(|e| {
        warn!("Reply carried malformed headers: {}", e);
        text_response(StatusCode::BAD_GATEWAY, "malformed tunnel reply")
    })
}

fn text_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let message = message.into();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message)))
        .expect("static response is always valid")
}
