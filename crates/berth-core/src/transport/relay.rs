//! Bidirectional byte relay between two hijacked transports.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

const CHUNK: usize = 16 * 1024;

/// Bytes moved in each direction over one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Relay bytes between `client` and `backend` until the backend is done.
///
/// Client EOF half-closes the backend (write side only) so it can still
/// answer. A failed client read or write instead ends the session at once
/// and drops the daemon connection. The session ends when backend→client
/// finishes; the client write side is then shut down and a still-running
/// client→backend copy is abandoned.
pub async fn bridge<C, B>(client: C, backend: B) -> std::io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    let upstream_bytes = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&upstream_bytes);
    let (client_failed_tx, client_failed_rx) = oneshot::channel::<std::io::Error>();
    let upstream = tokio::spawn(async move {
        let res = copy_counted(&mut client_rd, &mut backend_wr, &counter).await;
        match res {
            Ok(()) => {
                tracing::trace!("client finished sending, half-closing daemon side");
                if let Err(e) = backend_wr.shutdown().await {
                    tracing::debug!(error = %e, "half-close of daemon connection failed");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "client to daemon copy failed, closing daemon side");
                drop(backend_wr);
                let _ = client_failed_tx.send(e);
            }
        }
    });

    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let counter = AtomicU64::new(0);
        // A dropped sender means the client side ended cleanly; keep copying.
        let res = tokio::select! {
            res = copy_counted(&mut backend_rd, &mut client_wr, &counter) => res,
            Ok(e) = client_failed_rx => Err(e),
        };
        drop(backend_rd);
        let _ = client_wr.shutdown().await;
        let _ = done_tx.send(res.map(|()| counter.load(Ordering::Relaxed)));
    });

    let downstream = done_rx
        .await
        .unwrap_or_else(|_| Err(std::io::Error::other("relay task ended without reporting")));
    upstream.abort();

    Ok(RelayStats {
        client_to_backend: upstream_bytes.load(Ordering::Relaxed),
        backend_to_client: downstream?,
    })
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        writer.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_half_close_keeps_session_open() {
        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let (backend_near, mut backend_far) = tokio::io::duplex(1024);
        let session = tokio::spawn(bridge(client_near, backend_near));

        client_far.write_all(b"ls -l\n").await.unwrap();
        client_far.shutdown().await.unwrap();

        // The daemon sees the input followed by EOF...
        let mut input = Vec::new();
        backend_far.read_to_end(&mut input).await.unwrap();
        assert_eq!(input, b"ls -l\n");

        // ...while the session waits for its output.
        tokio::task::yield_now().await;
        assert!(!session.is_finished());

        backend_far.write_all(b"total 0\n").await.unwrap();
        backend_far.shutdown().await.unwrap();

        let stats = session.await.unwrap().unwrap();
        assert_eq!(
            stats,
            RelayStats {
                client_to_backend: 6,
                backend_to_client: 8,
            }
        );

        let mut output = Vec::new();
        client_far.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"total 0\n");
    }

    #[tokio::test]
    async fn test_backend_close_ends_session_while_client_still_open() {
        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let (backend_near, mut backend_far) = tokio::io::duplex(1024);
        let session = tokio::spawn(bridge(client_near, backend_near));

        backend_far.write_all(b"bye").await.unwrap();
        drop(backend_far);

        let stats = session.await.unwrap().unwrap();
        assert_eq!(stats.backend_to_client, 3);

        let mut output = Vec::new();
        client_far.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"bye");
    }

    /// A client transport whose reads fail as if the peer reset the connection.
    struct ResettingClient;

    impl AsyncRead for ResettingClient {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResettingClient {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_client_reset_closes_idle_daemon_connection() {
        let (backend_near, mut backend_far) = tokio::io::duplex(1024);
        let session = tokio::spawn(bridge(ResettingClient, backend_near));

        // The daemon never writes, yet its connection must be closed.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), backend_far.read(&mut buf))
            .await
            .expect("daemon connection should close after a client reset")
            .unwrap();
        assert_eq!(n, 0);

        let res = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("session should end after a client reset")
            .unwrap();
        assert_eq!(
            res.unwrap_err().kind(),
            std::io::ErrorKind::ConnectionReset
        );
    }

    #[tokio::test]
    async fn test_interleaved_traffic() {
        let (client_near, mut client_far) = tokio::io::duplex(64);
        let (backend_near, mut backend_far) = tokio::io::duplex(64);
        let session = tokio::spawn(bridge(client_near, backend_near));

        for line in ["echo a\n", "echo b\n"] {
            client_far.write_all(line.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; line.len()];
            backend_far.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, line.as_bytes());

            backend_far.write_all(&buf[5..]).await.unwrap();
            let mut echoed = vec![0u8; 2];
            client_far.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, &line.as_bytes()[5..]);
        }

        drop(backend_far);
        let stats = session.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, 14);
        assert_eq!(stats.backend_to_client, 4);
    }
}
