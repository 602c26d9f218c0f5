//! Bidirectional relay engine
//!
//! Pumps bytes between two stream endpoints until one direction ends. Each
//! read and each write refreshes an idle deadline; a direction hitting EOF
//! terminates the relay as success, anything else as the error it saw. Both
//! endpoints are shut down on the way out.
//!
//! Copy buffers are rented from a shared fixed-size pool and returned on
//! every exit path, including mid-copy cancellation.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Size of one relay copy buffer
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Buffers kept around after use; beyond this they are dropped
const MAX_IDLE_BUFFERS: usize = 64;

/// Pool of fixed-size byte buffers
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
}

/// A buffer rented from a [`BufferPool`], returned on drop
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Option<Vec<u8>>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buf_size` bytes
    pub const fn new(buf_size: usize) -> Self {
        BufferPool {
            free: Mutex::new(Vec::new()),
            buf_size,
        }
    }

    /// Rent a buffer; allocates when the free list is empty
    pub fn rent(&self) -> PooledBuf<'_> {
        let buf = self
            .free
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size]);
        PooledBuf {
            pool: self,
            buf: Some(buf),
        }
    }

    /// Buffers currently sitting in the free list
    pub fn idle_count(&self) -> usize {
        self.free.lock().expect("buffer pool poisoned").len()
    }

    fn put_back(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().expect("buffer pool poisoned");
        if free.len() < MAX_IDLE_BUFFERS {
            free.push(buf);
        }
    }
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer already returned")
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer already returned")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

static RELAY_POOL: BufferPool = BufferPool::new(RELAY_BUFFER_SIZE);

/// The shared relay buffer pool
pub fn pool() -> &'static BufferPool {
    &RELAY_POOL
}

/// Relay bytes between `a` and `b` until either side ends.
///
/// Returns `Ok` when a direction reached EOF, the error otherwise.
/// Cancellation surfaces as `io::ErrorKind::Interrupted`.
pub async fn relay<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        r = relay_one_direction(&mut a_read, &mut b_write, idle_timeout) => {
            trace!("a->b direction finished: {:?}", r);
            r
        }
        r = relay_one_direction(&mut b_read, &mut a_write, idle_timeout) => {
            trace!("b->a direction finished: {:?}", r);
            r
        }
        _ = cancel.cancelled() => {
            Err(io::Error::new(io::ErrorKind::Interrupted, "relay cancelled"))
        }
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    match result {
        Ok(copied) => {
            debug!(bytes = copied, "relay finished");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn relay_one_direction<R, W>(r: &mut R, w: &mut W, idle: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool().rent();
    let mut copied = 0u64;

    loop {
        let n = timeout(idle, r.read(&mut buf[..]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay read deadline"))??;
        if n == 0 {
            return Ok(copied);
        }
        timeout(idle, w.write_all(&buf[..n]))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay write deadline"))??;
        timeout(idle, w.flush())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay write deadline"))??;
        copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const IDLE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_relay_echo_both_directions() {
        let (mut client_a, server_a) = duplex(1024);
        let (mut client_b, server_b) = duplex(1024);

        let handle = tokio::spawn(relay(server_a, server_b, IDLE, CancellationToken::new()));

        client_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client_b.write_all(b"pong").await.unwrap();
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_a);
        drop(client_b);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_eof_is_success() {
        let (client_a, server_a) = duplex(64);
        let (client_b, server_b) = duplex(64);

        let handle = tokio::spawn(relay(server_a, server_b, IDLE, CancellationToken::new()));
        drop(client_a);
        drop(client_b);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_relay_closing_one_side_closes_other() {
        let (mut client_a, server_a) = duplex(64);
        let (mut client_b, server_b) = duplex(64);

        let handle = tokio::spawn(relay(server_a, server_b, IDLE, CancellationToken::new()));

        client_a.write_all(b"last words").await.unwrap();
        drop(client_a);

        let mut received = Vec::new();
        client_b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_large_transfer_intact() {
        let (mut client_a, server_a) = duplex(65536);
        let (mut client_b, server_b) = duplex(65536);

        let handle = tokio::spawn(relay(server_a, server_b, IDLE, CancellationToken::new()));

        let payload = vec![0x5A_u8; 100_000];
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                client_a.write_all(&payload).await.unwrap();
                drop(client_a);
            })
        };

        let mut received = Vec::new();
        client_b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        writer.await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (_client_a, server_a) = duplex(64);
        let (_client_b, server_b) = duplex(64);

        let result = relay(
            server_a,
            server_b,
            Duration::from_millis(50),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_relay_cancellation() {
        let (_client_a, server_a) = duplex(64);
        let (_client_b, server_b) = duplex(64);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay(server_a, server_b, IDLE, cancel.clone()));

        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(16);
        assert_eq!(pool.idle_count(), 0);
        {
            let mut buf = pool.rent();
            buf[0] = 0xAA;
            assert_eq!(buf.len(), 16);
        }
        assert_eq!(pool.idle_count(), 1);
        {
            let _a = pool.rent();
            assert_eq!(pool.idle_count(), 0);
            let _b = pool.rent();
        }
        assert_eq!(pool.idle_count(), 2);
    }
}
