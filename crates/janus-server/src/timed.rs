//! Read/write deadlines for inbound connections.
//!
//! [`TimedStream`] enforces the configured read and write timeouts at the
//! socket level: a poll that makes no progress within its window fails the
//! connection with `TimedOut`. Deadlines re-arm on every completed
//! operation, so long-lived keep-alive connections stay up as long as
//! bytes keep moving.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// A stream with per-operation read and write deadlines.
pub struct TimedStream<T> {
    inner: T,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<T> TimedStream<T> {
    /// Wrap `inner` with the given deadlines.
    pub fn new(inner: T, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Duration,
    cx: &mut Context<'_>,
    what: &'static str,
) -> Poll<io::Result<()>> {
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *deadline = None;
            Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, what)))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TimedStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = this.read_timeout;
                poll_deadline(&mut this.read_deadline, timeout, cx, "read timeout")
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TimedStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = this.write_timeout;
                match poll_deadline(&mut this.write_deadline, timeout, cx, "write timeout") {
                    Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                    Poll::Ready(Ok(())) => unreachable!("deadline never resolves ok"),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_stalled_read_times_out() {
        let (client, server) = tokio::io::duplex(64);
        // Nobody ever writes on the client side.
        let _client = client;
        let mut timed =
            TimedStream::new(server, Duration::from_millis(50), Duration::from_secs(5));
        let mut buf = [0u8; 8];
        let err = timed.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_progress_rearms_the_deadline() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut timed =
            TimedStream::new(server, Duration::from_millis(100), Duration::from_secs(5));
        let mut buf = [0u8; 4];
        // Two reads spaced beyond one window, each fed in time.
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            client.write_all(b"ping").await.unwrap();
            timed.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        }
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let (client, server) = tokio::io::duplex(4);
        // Keep the peer alive but never drain it, so the tiny buffer fills.
        let _client = client;
        let mut timed =
            TimedStream::new(server, Duration::from_secs(5), Duration::from_millis(50));
        let err = timed.write_all(&[0u8; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
