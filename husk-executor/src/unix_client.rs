//! Minimal HTTP/1 client over a Unix domain socket or plain TCP stream.
//!
//! Firecracker exposes its management API via a Unix socket, not TCP.
//! Standard HTTP clients (reqwest) don't support Unix sockets, so we
//! build a thin wrapper using hyper + tokio's `UnixStream`. The same
//! request path is reused for the guest agent's TCP health endpoint.

use std::net::SocketAddr;
use std::path::Path;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::ExecutorError;

/// A completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn transport(path: &str, reason: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::ApiTransport { path: path.to_owned(), reason: reason.to_string() }
}

async fn send<S>(
    stream: S,
    host: &str,
    method: Method,
    uri_path: &str,
    body: Option<String>,
) -> Result<HttpResponse, ExecutorError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| transport(uri_path, format!("HTTP handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("HTTP connection closed: {e}");
        }
    });

    let body_bytes = body.map(Bytes::from).unwrap_or_default();
    let content_len = body_bytes.len();

    let uri: Uri = uri_path
        .parse()
        .map_err(|e| transport(uri_path, format!("invalid URI path: {e}")))?;

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Host", host)
        .header("Accept", "application/json");

    if content_len > 0 {
        builder = builder.header("Content-Type", "application/json");
        builder = builder.header("Content-Length", content_len.to_string());
    }

    let req = builder
        .body(Full::new(body_bytes))
        .map_err(|e| transport(uri_path, format!("build request: {e}")))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| transport(uri_path, format!("send request: {e}")))?;

    let status = resp.status().as_u16();
    let body_bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| transport(uri_path, format!("read response body: {e}")))?
        .to_bytes();

    Ok(HttpResponse { status, body: String::from_utf8_lossy(&body_bytes).into_owned() })
}

/// Send an HTTP request to a Firecracker API socket.
///
/// The `uri_path` should be the path component only (e.g. `/boot-source`).
/// The host header is set to `localhost` as required by Firecracker.
///
/// # Errors
/// Returns [`ExecutorError::ApiTransport`] on connection errors and
/// [`ExecutorError::ApiError`] on a non-2xx status.
pub(crate) async fn api_request(
    socket_path: &Path,
    method: Method,
    uri_path: &str,
    body: Option<String>,
) -> Result<String, ExecutorError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| transport(uri_path, format!("connect to {}: {e}", socket_path.display())))?;

    let method_name = method.to_string();
    let resp = send(stream, "localhost", method, uri_path, body).await?;

    if !resp.is_success() {
        return Err(ExecutorError::ApiError {
            method: method_name,
            path: uri_path.to_owned(),
            status: resp.status,
            body: resp.body,
        });
    }

    Ok(resp.body)
}

/// Plain GET over TCP, returning whatever status the peer answered with.
///
/// # Errors
/// Returns [`ExecutorError::ApiTransport`] if the peer cannot be reached.
pub(crate) async fn tcp_get(addr: SocketAddr, uri_path: &str) -> Result<HttpResponse, ExecutorError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| transport(uri_path, format!("connect to {addr}: {e}")))?;
    send(stream, &addr.to_string(), Method::GET, uri_path, None).await
}
