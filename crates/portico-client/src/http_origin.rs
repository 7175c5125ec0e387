//! HTTP origin dispatcher
//!
//! Forwards tunneled HTTP requests to the local service using hyper with a
//! small connection pool, and turns the outcome into an `HttpResponse`
//! frame. A failed origin call becomes a frame with `error` set; the server
//! answers the public caller with 502.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use portico_proto::Frame;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Maximum number of pooled connections to the origin
const MAX_POOL_SIZE: usize = 10;

/// Origin call errors
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Response error: {0}")]
    ResponseError(String),
}

/// HTTP client for the local origin, with connection pooling.
#[derive(Clone)]
pub struct HttpOrigin {
    /// Target address (host:port)
    target: String,
    pool: Arc<Mutex<Vec<http1::SendRequest<Full<Bytes>>>>>,
}

impl HttpOrigin {
    pub fn new(target: String) -> Self {
        Self {
            target,
            pool: Arc::new(Mutex::new(Vec::with_capacity(MAX_POOL_SIZE))),
        }
    }

    /// Get or create a connection to the origin
    async fn get_connection(&self) -> Result<http1::SendRequest<Full<Bytes>>, OriginError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(sender) = pool.pop() {
                if sender.is_ready() {
                    debug!("Reusing pooled connection to {}", self.target);
                    return Ok(sender);
                }
                debug!("Discarding stale connection from pool");
            }
        }

        debug!("Creating new connection to {}", self.target);
        let stream = TcpStream::connect(&self.target).await.map_err(|e| {
            OriginError::ConnectionFailed(format!("Failed to connect to {}: {}", self.target, e))
        })?;

        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| OriginError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;

        // Drive the connection until it closes
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Origin connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    /// Return a connection to the pool
    async fn return_connection(&self, sender: http1::SendRequest<Full<Bytes>>) {
        if !sender.is_ready() {
            return;
        }

        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
        }
    }

    /// Forward one tunneled request to the origin.
    ///
    /// Always produces an `HttpResponse` frame for `request_id`: the
    /// origin's reply on success, a 502-with-error frame on failure.
    pub async fn forward(
        &self,
        request_id: &str,
        method: &str,
        path_and_query: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Frame {
        match self
            .try_forward(method, path_and_query, headers, body)
            .await
        {
            Ok((status, headers, body)) => Frame::HttpResponse {
                request_id: request_id.to_string(),
                status,
                headers,
                body,
                error: None,
            },
            Err(e) => {
                error!("Origin call failed for request {}: {}", request_id, e);
                Frame::HttpResponse {
                    request_id: request_id.to_string(),
                    status: 502,
                    headers: Vec::new(),
                    body: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_forward(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<(u16, Vec<(String, String)>, Option<Vec<u8>>), OriginError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| OriginError::InvalidRequest(format!("bad method: {}", e)))?;

        let mut builder = Request::builder().method(method).uri(path_and_query);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = Full::new(Bytes::from(body.unwrap_or_default()));
        let request = builder
            .body(body)
            .map_err(|e| OriginError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let mut sender = self.get_connection().await?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| OriginError::RequestFailed(format!("Failed to send request: {}", e)))?;
        self.return_connection(sender).await;

        let status = response.status().as_u16();

        // The body is re-buffered end to end, so the origin's framing
        // headers are dropped and recomputed on the public side.
        let mut resp_headers: Vec<(String, String)> = Vec::new();
        for (name, value) in response.headers() {
            if name == hyper::header::TRANSFER_ENCODING || name == hyper::header::CONTENT_LENGTH {
                continue;
            }
            resp_headers.push((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            ));
        }

        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| OriginError::ResponseError(format!("Failed to read response body: {}", e)))?
            .to_bytes();
        let body = if body_bytes.is_empty() {
            None
        } else {
            Some(body_bytes.to_vec())
        };

        Ok((status, resp_headers, body))
    }
}
