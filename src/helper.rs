//! Stream glue shared across the server
//!
//! Defines the boxed stream abstraction handlers operate on, plus a small
//! read-ahead wrapper used when a request parse has to borrow bytes that
//! belong to the application data following it.

use bytes::{Buf, Bytes};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Default idle timeout for relayed connections, in seconds
pub const DEFAULT_RELAY_IDLE_TIMEOUT_SECS: u64 = 120;

/// Default timeout for a single-accept BIND, in seconds
pub const DEFAULT_BIND_ACCEPT_TIMEOUT_SECS: u64 = 120;

/// Maximum UDP payload the server will handle
pub const MAX_UDP_PACKET: usize = 65535;

/// Object-safe alias for the byte streams command handlers consume.
///
/// Every transport the server accepts from (plain TCP, TLS, a multiplexed
/// channel, an in-memory duplex in tests) is erased to this trait before the
/// handshake hands it to a command handler.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A boxed [`AsyncStream`]
pub type BoxedStream = Box<dyn AsyncStream>;

/// Stream wrapper that replays already-consumed bytes before reading on.
///
/// The fragment-policy path reads one network packet up front and parses the
/// request out of it; whatever follows the request in that packet (usually
/// the client's initial data) is handed back here so the rest of the
/// pipeline sees one contiguous stream.
pub struct BufferedStream<S> {
    leftover: Bytes,
    inner: S,
}

impl<S> BufferedStream<S> {
    /// Wrap `inner`, serving `leftover` before any further reads.
    pub fn new(leftover: Bytes, inner: S) -> Self {
        BufferedStream { leftover, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            buf.put_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
