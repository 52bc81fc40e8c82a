//! A scripted Engine API daemon on a temporary Unix socket.
//!
//! Routes, matched on the path with any `/vX.Y` prefix removed:
//!
//! | path | behaviour |
//! |---|---|
//! | `/containers/missing/json` | `404 {"message":"No such container: missing"}` |
//! | `/images/*/get` | streams three `chunk-N\n` frames as `application/x-tar` |
//! | `/events` | sends one JSON event, then holds the stream open until dropped |
//! | `/containers/*/attach` with `Upgrade` | `101`, then echoes bytes and writes `bye\n` after client EOF |
//! | anything else | `200` with a JSON echo of method, path, query and body, labelled `text/plain` |
//!
//! Every request head is recorded for later inspection.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use berth_core::request::api_path;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Frame, Incoming};
use hyper::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

type FakeBody = UnsyncBoxBody<Bytes, Infallible>;

/// Head of a request the fake daemon received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    /// Path plus query, exactly as it arrived on the wire.
    pub target: String,
    pub headers: HeaderMap,
}

#[derive(Default)]
struct Shared {
    requests: Mutex<Vec<RecordedRequest>>,
    event_stream_closed: Notify,
}

/// A running fake daemon. Stops when dropped.
pub struct FakeDaemon {
    socket: PathBuf,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl FakeDaemon {
    /// Bind a fresh socket in a temp dir and start serving.
    pub async fn start() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("failed to bind fake daemon socket");
        let shared = Arc::new(Shared::default());

        let task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let service = hyper::service::service_fn(move |req| {
                            let shared = Arc::clone(&shared);
                            async move { Ok::<_, Infallible>(route(req, shared).await) }
                        });
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await;
                    });
                }
            })
        };

        Self {
            socket,
            shared,
            task,
            _dir: dir,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Every request head received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared
            .requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// The most recent request head, if any.
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests().pop()
    }

    /// Wait until the `/events` stream has been abandoned by its reader.
    /// Returns `false` on timeout.
    pub async fn event_stream_closed(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.shared.event_stream_closed.notified())
            .await
            .is_ok()
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn route(mut req: Request<Incoming>, shared: Arc<Shared>) -> Response<FakeBody> {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    if let Ok(mut requests) = shared.requests.lock() {
        requests.push(RecordedRequest {
            method: req.method().clone(),
            target,
            headers: req.headers().clone(),
        });
    }

    let path = api_path(req.uri().path()).to_string();
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match segments.as_slice() {
        ["containers", "missing", "json"] => json(
            StatusCode::NOT_FOUND,
            r#"{"message":"No such container: missing"}"#.to_string(),
        ),
        ["images", .., "get"] => download(),
        ["events"] => events(shared),
        ["containers", _, "attach"] if req.headers().contains_key(UPGRADE) => {
            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                if let Ok(upgraded) = on_upgrade.await {
                    echo_until_eof(TokioIo::new(upgraded)).await;
                }
            });
            Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(CONTENT_TYPE, "application/vnd.docker.multiplexed-stream")
                .header(CONNECTION, "Upgrade")
                .header(UPGRADE, "tcp")
                .body(empty())
                .expect("static response")
        }
        _ => echo(req).await,
    }
}

async fn echo(req: Request<Incoming>) -> Response<FakeBody> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let payload = json!({
        "method": method,
        "path": path,
        "query": query,
        "body": String::from_utf8_lossy(&body),
    })
    .to_string();
    Response::builder()
        .header(CONTENT_TYPE, "text/plain")
        .header("Api-Version", "1.43")
        .body(full(payload))
        .expect("static response")
}

fn download() -> Response<FakeBody> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        for i in 0..3 {
            if tx.send(Bytes::from(format!("chunk-{i}\n"))).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
    Response::builder()
        .header(CONTENT_TYPE, "application/x-tar")
        .body(ChannelBody { rx }.boxed_unsync())
        .expect("static response")
}

fn events(shared: Arc<Shared>) -> Response<FakeBody> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let event = Bytes::from_static(b"{\"status\":\"start\",\"id\":\"abc\"}\n");
        if tx.send(event).await.is_ok() {
            tx.closed().await;
        }
        shared.event_stream_closed.notify_one();
    });
    Response::builder()
        .header(CONTENT_TYPE, "application/json")
        .body(ChannelBody { rx }.boxed_unsync())
        .expect("static response")
}

async fn echo_until_eof<S>(mut io: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match io.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if io.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
    let _ = io.write_all(b"bye\n").await;
    let _ = io.shutdown().await;
}

fn json(status: StatusCode, body: String) -> Response<FakeBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(body))
        .expect("static response")
}

fn full(body: impl Into<Bytes>) -> FakeBody {
    Full::new(body.into()).boxed_unsync()
}

fn empty() -> FakeBody {
    full(Bytes::new())
}

/// A response body fed from a channel, one frame per message.
struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|b| Ok(Frame::data(b))))
    }
}
