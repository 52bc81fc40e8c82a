//! Listening sockets.
//!
//! TCP and Unix listeners are bound up front so that startup fails fast, then
//! each one runs its own accept loop. Unix sockets are created fresh, handed
//! to the configured group and restricted to `0660`.

use std::convert::Infallible;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use berth_config::{DEFAULT_SOCKET_GROUP, ListenAddr};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use nix::unistd::{Gid, Group};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::oneshot;
use tower::Service;

use crate::transport::{ConnectionClaim, RawConnection, is_benign};

/// Permission bits applied to Unix sockets.
pub const SOCKET_MODE: u32 = 0o660;

/// Pause after a failed accept so resource exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors from setting up a listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: ListenAddr,
        source: std::io::Error,
    },

    #[error("cannot prepare socket {}: {source}", path.display())]
    Socket {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("group {0} not found")]
    UnknownGroup(String),

    #[error("failed to look up group {group}: {source}")]
    GroupLookup { group: String, source: nix::Error },

    #[error("failed to change group of {}: {source}", path.display())]
    Chown { path: PathBuf, source: nix::Error },
}

/// A bound, not yet serving, listener.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl BoundListener {
    /// The address actually bound (resolves port `0`).
    pub fn local_addr(&self) -> std::io::Result<ListenAddr> {
        match self {
            BoundListener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(ListenAddr::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            BoundListener::Unix { path, .. } => Ok(ListenAddr::Unix(path.clone())),
        }
    }

    /// Stop listening without serving; a Unix socket file is removed.
    pub fn close(self) {
        if let BoundListener::Unix { listener, path } = self {
            drop(listener);
            remove_socket(&path);
        }
    }
}

/// Bind one listen address.
pub async fn bind(addr: &ListenAddr, group: &str) -> Result<BoundListener, ListenerError> {
    match addr {
        ListenAddr::Tcp { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port))
                .await
                .map_err(|source| ListenerError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            Ok(BoundListener::Tcp(listener))
        }
        ListenAddr::Unix(path) => bind_unix(addr, path, group),
    }
}

fn bind_unix(addr: &ListenAddr, path: &Path, group: &str) -> Result<BoundListener, ListenerError> {
    let socket_err = |source| ListenerError::Socket {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(socket_err(e)),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(socket_err)?;
    }

    let listener = UnixListener::bind(path).map_err(|source| ListenerError::Bind {
        addr: addr.clone(),
        source,
    })?;
    let bound = BoundListener::Unix {
        listener,
        path: path.to_path_buf(),
    };

    let prepared = set_socket_group(path, group).and_then(|()| {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(socket_err)
    });
    match prepared {
        Ok(()) => Ok(bound),
        Err(e) => {
            bound.close();
            Err(e)
        }
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!(path = %path.display(), error = %e, "socket already gone");
    }
}

/// Hand the socket to `group`. Failures are only tolerated for the default group.
fn set_socket_group(path: &Path, group: &str) -> Result<(), ListenerError> {
    if group.is_empty() {
        return Ok(());
    }

    let changed = resolve_group(group).and_then(|gid| {
        nix::unistd::chown(path, None, Some(gid)).map_err(|source| ListenerError::Chown {
            path: path.to_path_buf(),
            source,
        })
    });

    match changed {
        Ok(()) => Ok(()),
        Err(e) if group == DEFAULT_SOCKET_GROUP => {
            tracing::debug!(path = %path.display(), error = %e, "could not hand socket to default group");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Resolve a group name or numeric gid.
fn resolve_group(group: &str) -> Result<Gid, ListenerError> {
    if let Ok(raw) = group.parse::<u32>() {
        let gid = Gid::from_raw(raw);
        if !matches!(Group::from_gid(gid), Ok(Some(_))) {
            tracing::warn!(gid = raw, "no group entry for gid, using it as is");
        }
        return Ok(gid);
    }

    match Group::from_name(group) {
        Ok(Some(entry)) => Ok(entry.gid),
        Ok(None) => Err(ListenerError::UnknownGroup(group.to_string())),
        Err(source) => Err(ListenerError::GroupLookup {
            group: group.to_string(),
            source,
        }),
    }
}

trait Acceptor {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept_stream(&self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    fn accept_stream(&self) -> impl Future<Output = std::io::Result<TcpStream>> + Send {
        async move { self.accept().await.map(|(stream, _)| stream) }
    }
}

impl Acceptor for UnixListener {
    type Stream = UnixStream;

    fn accept_stream(&self) -> impl Future<Output = std::io::Result<UnixStream>> + Send {
        async move { self.accept().await.map(|(stream, _)| stream) }
    }
}

/// Accept and serve connections until `shutdown` fires (or its sender is dropped).
///
/// A Unix socket file is removed once the loop ends. Connections already
/// accepted keep running to completion.
pub async fn serve(listener: BoundListener, app: Router, shutdown: oneshot::Receiver<()>) {
    match listener {
        BoundListener::Tcp(listener) => {
            let label = listener
                .local_addr()
                .map(|a| format!("tcp://{a}"))
                .unwrap_or_else(|_| "tcp".to_string());
            tracing::info!(addr = %label, "gateway listening");
            accept_loop(&listener, &label, app, shutdown).await;
        }
        BoundListener::Unix { listener, path } => {
            let label = format!("unix://{}", path.display());
            tracing::info!(addr = %label, "gateway listening");
            accept_loop(&listener, &label, app, shutdown).await;
            BoundListener::Unix { listener, path }.close();
        }
    }
}

async fn accept_loop<A: Acceptor>(
    acceptor: &A,
    label: &str,
    app: Router,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(addr = %label, "listener closed");
                return;
            }
            accepted = acceptor.accept_stream() => match accepted {
                Ok(stream) => serve_connection(stream, app.clone()),
                Err(e) => {
                    tracing::warn!(addr = %label, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Serve HTTP/1 on one connection.
///
/// Connections are run without hyper's own shutdown so that a response
/// carrying a [`ConnectionClaim`] can take the raw stream back once it has
/// been written.
fn serve_connection<S>(stream: S, app: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let pending: Arc<Mutex<Option<ConnectionClaim>>> = Arc::default();
        let service = {
            let pending = Arc::clone(&pending);
            hyper::service::service_fn(move |req: hyper::Request<Incoming>| {
                let mut app = app.clone();
                let pending = Arc::clone(&pending);
                async move {
                    let mut resp = app.call(req).await?;
                    if let Some(claim) = ConnectionClaim::take_from(&mut resp) {
                        if let Ok(mut slot) = pending.lock() {
                            *slot = Some(claim);
                        }
                    }
                    Ok::<_, Infallible>(resp)
                }
            })
        };

        let parts = match http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .without_shutdown()
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                if is_benign(&e) {
                    tracing::trace!(error = %e, "client connection ended");
                } else {
                    tracing::error!(error = %e, "error serving connection");
                }
                return;
            }
        };

        let claim = pending.lock().ok().and_then(|mut slot| slot.take());
        let mut io = parts.io.into_inner();
        match claim {
            Some(claim) => {
                if !claim.fulfill(RawConnection::new(io, parts.read_buf)) {
                    tracing::debug!("client connection taken over, but nobody claimed it");
                }
            }
            None => {
                if let Err(e) = io.shutdown().await {
                    tracing::trace!(error = %e, "client connection shutdown failed");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_tcp_ephemeral_port() {
        let addr = ListenAddr::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let listener = bind(&addr, "").await.unwrap();
        match listener.local_addr().unwrap() {
            ListenAddr::Tcp { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_ne!(port, 0);
            }
            other => panic!("unexpected address {other}"),
        }
    }

    #[tokio::test]
    async fn test_bind_unix_sets_mode_and_replaces_stale_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run").join("berth.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let _listener = bind(&ListenAddr::Unix(path.clone()), "").await.unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o660);
    }

    #[tokio::test]
    async fn test_bind_unix_numeric_own_group() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("berth.sock");
        let gid = nix::unistd::getegid();

        let _listener = bind(&ListenAddr::Unix(path.clone()), &gid.to_string())
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().gid(), gid.as_raw());
    }

    #[tokio::test]
    async fn test_default_group_failure_is_tolerated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("berth.sock");
        assert!(
            bind(&ListenAddr::Unix(path), DEFAULT_SOCKET_GROUP)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_unknown_named_group_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("berth.sock");
        let err = bind(&ListenAddr::Unix(path.clone()), "berth-no-such-group")
            .await
            .unwrap_err();
        assert!(matches!(err, ListenerError::UnknownGroup(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_close_removes_unserved_socket() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("berth.sock");
        let listener = bind(&ListenAddr::Unix(path.clone()), "").await.unwrap();
        assert!(path.exists());
        listener.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_serve_stops_and_removes_socket() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("berth.sock");
        let listener = bind(&ListenAddr::Unix(path.clone()), "").await.unwrap();

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(serve(listener, Router::new(), stop_rx));

        let _ = UnixStream::connect(&path).await.unwrap();
        stop_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(!path.exists());
    }
}
