//! Transport handlers for the real-daemon backend.
//!
//! Every request gets its own Unix socket connection to the daemon, driven by
//! a hyper http1 client connection on a spawned task. What differs per
//! [`TransportMode`] is how the response travels back:
//!
//! - [`Direct`](TransportMode::Direct): body collected, JSON content type.
//! - [`DownloadStream`](TransportMode::DownloadStream): status first, body frames as they arrive.
//! - [`EventStream`](TransportMode::EventStream): like download, but the daemon
//!   connection is dropped as soon as the client stops reading.
//! - [`InteractiveStream`](TransportMode::InteractiveStream): both connections hijacked and bridged.

pub mod hijack;
pub mod relay;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, header};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Frame, Incoming, SizeHint};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::sync::oneshot;

use crate::classify::TransportMode;
use crate::error::{GatewayError, Result};

pub use hijack::{ClaimedConnection, ConnectionClaim, HijackHandle, RawConnection};
pub use relay::{RelayStats, bridge};

/// Content type of a hijacked attach/exec stream.
pub const RAW_STREAM: &str = "application/vnd.docker.raw-stream";

const JSON: &str = "application/json";

/// Headers that describe one hop and are never forwarded as-is.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

type DaemonConn = http1::Connection<TokioIo<UnixStream>, Body>;

/// Opens connections to the real daemon's Unix socket.
#[derive(Debug, Clone)]
pub struct DaemonDialer {
    socket: PathBuf,
}

impl DaemonDialer {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Connect a fresh stream to the daemon socket.
    pub async fn dial(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket)
            .await
            .map_err(|source| GatewayError::Dial {
                path: self.socket.clone(),
                source,
            })
    }

    async fn handshake(&self) -> Result<(http1::SendRequest<Body>, DaemonConn)> {
        let stream = self.dial().await?;
        http1::Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| GatewayError::Backend(format!("handshake failed: {e}")))
    }
}

/// Relays requests to the real daemon under a given transport mode.
#[derive(Debug, Clone)]
pub struct DaemonProxy {
    dialer: DaemonDialer,
}

impl DaemonProxy {
    pub fn new(dialer: DaemonDialer) -> Self {
        Self { dialer }
    }

    pub fn dialer(&self) -> &DaemonDialer {
        &self.dialer
    }

    /// Forward `req` and relay the daemon's answer under `mode`.
    pub async fn forward(&self, mode: TransportMode, req: Request<Body>) -> Result<Response<Body>> {
        match mode {
            TransportMode::Direct => self.direct(req).await,
            TransportMode::DownloadStream => self.download(req).await,
            TransportMode::EventStream => self.events(req).await,
            TransportMode::InteractiveStream => self.interactive(req).await,
        }
    }

    async fn direct(&self, req: Request<Body>) -> Result<Response<Body>> {
        let (mut sender, conn) = self.dialer.handshake().await?;
        tokio::spawn(drive(conn));

        let resp = send(&mut sender, outbound(req, false)?).await?;
        let (parts, incoming) = resp.into_parts();
        let body = incoming
            .collect()
            .await
            .map_err(|e| GatewayError::Backend(format!("reading response body: {e}")))?
            .to_bytes();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers, false);
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON));
        Ok(response(parts.status, headers, Body::from(body)))
    }

    async fn download(&self, req: Request<Body>) -> Result<Response<Body>> {
        let (mut sender, conn) = self.dialer.handshake().await?;
        tokio::spawn(drive(conn));

        let resp = send(&mut sender, outbound(req, false)?).await?;
        let (parts, incoming) = resp.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers, false);
        Ok(response(parts.status, headers, Body::new(incoming)))
    }

    async fn events(&self, req: Request<Body>) -> Result<Response<Body>> {
        let (mut sender, conn) = self.dialer.handshake().await?;
        let (teardown, client_gone) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                res = conn => log_connection_end("event stream", res),
                _ = client_gone => {
                    tracing::debug!("event stream reader gone, dropping daemon connection");
                }
            }
        });

        let resp = send(&mut sender, outbound(req, false)?).await?;
        let (parts, incoming) = resp.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers, false);
        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(JSON));
        if !is_json {
            headers.remove(header::CONTENT_TYPE);
        }

        let body = GuardedBody {
            inner: incoming,
            _teardown: teardown,
        };
        Ok(response(parts.status, headers, Body::new(body)))
    }

    /// Ask the daemon for an upgrade and bridge its raw stream with the
    /// client's connection.
    ///
    /// A client that asked for an upgrade gets `101`; one that did not gets
    /// `200` and `Connection: close`. Either way the listener hands over the
    /// client connection once the answer is written.
    async fn interactive(&self, req: Request<Body>) -> Result<Response<Body>> {
        let client_upgrade = crate::request::wants_upgrade(req.headers());

        let (mut sender, conn) = self.dialer.handshake().await?;
        tokio::spawn(async move {
            log_connection_end("interactive", conn.with_upgrades().await);
        });

        let resp = send(&mut sender, outbound(req, true)?).await?;
        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::debug!(status = %resp.status(), "daemon refused the upgrade, relaying its answer");
            let (parts, incoming) = resp.into_parts();
            let mut headers = parts.headers;
            strip_hop_by_hop(&mut headers, false);
            return Ok(response(parts.status, headers, Body::new(incoming)));
        }

        let backend = HijackHandle::from_response(resp);
        let (claim, client) = ConnectionClaim::new();

        tokio::spawn(async move {
            let (client_io, backend_io) = match tokio::try_join!(client.take(), backend.take()) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "hijack setup failed");
                    return;
                }
            };
            match bridge(client_io, backend_io).await {
                Ok(stats) => tracing::debug!(
                    client_to_backend = stats.client_to_backend,
                    backend_to_client = stats.backend_to_client,
                    "interactive session closed"
                ),
                Err(e) if is_benign(&e) => tracing::debug!(error = %e, "interactive session ended"),
                Err(e) => tracing::warn!(error = %e, "interactive session failed"),
            }
        });

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(RAW_STREAM));
        let status = if client_upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
            headers.insert(header::UPGRADE, HeaderValue::from_static("tcp"));
            StatusCode::SWITCHING_PROTOCOLS
        } else {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
            StatusCode::OK
        };
        let mut resp = response(status, headers, Body::empty());
        claim.attach(&mut resp);
        Ok(resp)
    }
}

async fn send(sender: &mut http1::SendRequest<Body>, req: Request<Body>) -> Result<Response<Incoming>> {
    sender
        .send_request(req)
        .await
        .map_err(|e| GatewayError::Backend(e.to_string()))
}

async fn drive(conn: DaemonConn) {
    log_connection_end("daemon", conn.await);
}

fn log_connection_end(kind: &str, res: std::result::Result<(), hyper::Error>) {
    if let Err(e) = res {
        if is_benign(&e) {
            tracing::trace!(kind, error = %e, "daemon connection ended");
        } else {
            tracing::debug!(kind, error = %e, "daemon connection failed");
        }
    }
}

/// Whether an error is the ordinary end of a connection rather than a fault.
pub(crate) fn is_benign(err: &dyn std::fmt::Display) -> bool {
    let msg = err.to_string().to_lowercase();
    ["canceled", "incomplete", "broken pipe", "connection reset", "not connected"]
        .iter()
        .any(|needle| msg.contains(needle))
}

/// Rebuild a client request for the daemon connection.
///
/// Only the path and query are sent; `Host` becomes `localhost`. Outside of
/// upgrades the connection is closed after one exchange. An upgrade request
/// keeps the client's `Connection`/`Upgrade` pair, or gets `Upgrade: tcp`
/// when the client sent none.
fn outbound(req: Request<Body>, upgrade: bool) -> Result<Request<Body>> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", PathAndQuery::as_str);

    let mut out = Request::builder()
        .method(parts.method.clone())
        .uri(path_and_query)
        .body(body)
        .map_err(|e| GatewayError::Backend(format!("invalid request: {e}")))?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers, upgrade);
    if !upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    } else if !headers.contains_key(header::UPGRADE) {
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("tcp"));
    }
    headers.insert(header::HOST, HeaderValue::from_static("localhost"));
    *out.headers_mut() = headers;
    Ok(out)
}

fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    for name in &HOP_BY_HOP {
        if keep_upgrade && (name == header::CONNECTION || name == header::UPGRADE) {
            continue;
        }
        headers.remove(name);
    }
}

fn response(status: StatusCode, headers: HeaderMap, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

/// Response body that tears down its daemon connection when dropped.
struct GuardedBody {
    inner: Incoming,
    _teardown: oneshot::Sender<()>,
}

impl hyper::body::Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use pretty_assertions::assert_eq;

    fn client_request(headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("http://gateway.local/v1.43/containers/abc/attach?stream=1");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_outbound_keeps_path_and_query_only() {
        let out = outbound(client_request(&[("host", "gateway.local")]), false).unwrap();
        assert_eq!(out.uri().to_string(), "/v1.43/containers/abc/attach?stream=1");
        assert_eq!(out.headers()[header::HOST], "localhost");
        assert_eq!(out.headers()[header::CONNECTION], "close");
    }

    #[test]
    fn test_outbound_strips_hop_by_hop() {
        let out = outbound(
            client_request(&[
                ("connection", "keep-alive"),
                ("keep-alive", "timeout=5"),
                ("transfer-encoding", "chunked"),
                ("content-type", "application/json"),
                ("x-registry-auth", "e30="),
            ]),
            false,
        )
        .unwrap();
        let headers = out.headers();
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(headers["x-registry-auth"], "e30=");
    }

    #[test]
    fn test_outbound_upgrade_keeps_connection_headers() {
        let out = outbound(
            client_request(&[("connection", "Upgrade"), ("upgrade", "tcp"), ("te", "trailers")]),
            true,
        )
        .unwrap();
        let headers = out.headers();
        assert_eq!(headers[header::CONNECTION], "Upgrade");
        assert_eq!(headers[header::UPGRADE], "tcp");
        assert!(headers.get(header::TE).is_none());
    }

    #[test]
    fn test_outbound_upgrade_is_requested_for_plain_attach() {
        let out = outbound(client_request(&[("connection", "keep-alive")]), true).unwrap();
        let headers = out.headers();
        assert_eq!(headers[header::CONNECTION], "Upgrade");
        assert_eq!(headers[header::UPGRADE], "tcp");
    }

    #[test]
    fn test_benign_errors() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(is_benign(&reset));
        let pipe = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(is_benign(&pipe));
        assert!(!is_benign(&std::io::Error::other("disk on fire")));
    }

    #[tokio::test]
    async fn test_dial_missing_socket() {
        let dialer = DaemonDialer::new("/nonexistent/berth/daemon.sock");
        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, GatewayError::Dial { .. }));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
