//! Connection takeover.
//!
//! The daemon side is taken over with hyper's upgrade machinery: a
//! [`HijackHandle`] is claimed from the `101` response and resolves to the raw
//! transport once hyper has finished the switch.
//!
//! The client side is taken over by the listener instead. A handler that
//! wants the client's transport attaches a [`ConnectionClaim`] to its
//! response. Once that response has been written, the listener stops serving
//! HTTP on the connection and hands the raw stream, plus anything the client
//! already sent, to the matching [`ClaimedConnection`]. This works whether or
//! not the client asked for an upgrade.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::http::Response;
use bytes::{Buf, Bytes};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::error::{GatewayError, Result};

/// The right to take over the daemon connection a `101` response arrived on.
#[derive(Debug)]
pub struct HijackHandle {
    upgrade: OnUpgrade,
}

impl HijackHandle {
    pub fn from_response<B>(resp: Response<B>) -> Self {
        Self {
            upgrade: hyper::upgrade::on(resp),
        }
    }

    /// Wait for the switch to complete and take the raw transport.
    pub async fn take(self) -> Result<TokioIo<Upgraded>> {
        self.upgrade
            .await
            .map(TokioIo::new)
            .map_err(|e| GatewayError::Hijack(format!("daemon side: {e}")))
    }
}

/// Anything a client connection can be turned into.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// A client connection no longer spoken to in HTTP.
///
/// Bytes the HTTP layer had buffered past the request head are read first.
pub struct RawConnection {
    buffered: Bytes,
    io: Box<dyn RawStream>,
}

impl RawConnection {
    pub fn new(io: impl RawStream + 'static, buffered: Bytes) -> Self {
        Self {
            buffered,
            io: Box::new(io),
        }
    }
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("buffered", &self.buffered.len())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for RawConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.buffered.has_remaining() {
            let n = self.buffered.len().min(buf.remaining());
            buf.put_slice(&self.buffered[..n]);
            self.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for RawConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// A request for the client connection, carried in response extensions.
#[derive(Clone)]
pub struct ConnectionClaim {
    tx: Arc<Mutex<Option<oneshot::Sender<RawConnection>>>>,
}

impl std::fmt::Debug for ConnectionClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionClaim").finish_non_exhaustive()
    }
}

impl ConnectionClaim {
    pub fn new() -> (Self, ClaimedConnection) {
        let (tx, rx) = oneshot::channel();
        let claim = Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        };
        (claim, ClaimedConnection { rx })
    }

    /// Mark `resp` as the last HTTP exchange on its connection.
    pub fn attach<B>(self, resp: &mut Response<B>) {
        resp.extensions_mut().insert(self);
    }

    /// Remove a claim from a response about to be written.
    pub fn take_from<B>(resp: &mut Response<B>) -> Option<Self> {
        resp.extensions_mut().remove::<Self>()
    }

    /// Hand over the raw connection. Returns `false` if nobody waits for it.
    pub fn fulfill(self, conn: RawConnection) -> bool {
        let sender = self.tx.lock().ok().and_then(|mut tx| tx.take());
        sender.is_some_and(|tx| tx.send(conn).is_ok())
    }
}

/// The waiting end of a [`ConnectionClaim`].
#[derive(Debug)]
pub struct ClaimedConnection {
    rx: oneshot::Receiver<RawConnection>,
}

impl ClaimedConnection {
    /// Wait until the listener hands the connection over.
    pub async fn take(self) -> Result<RawConnection> {
        self.rx.await.map_err(|_| {
            GatewayError::Hijack("client side: connection closed before takeover".to_string())
        })
    }
}
