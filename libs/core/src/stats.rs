//! Traffic counters and pooled copy buffers.
//!
//! One [`Stats`] instance is created per process and shared by every
//! transport through an `Arc`. Copy loops borrow their scratch space from a
//! [`BufferPool`] so long-lived sessions do not allocate per read.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default copy buffer size in KiB.
pub const DEFAULT_BUFFER_KB: usize = 32;

/// Free buffers kept around for reuse.
const MAX_IDLE_BUFFERS: usize = 256;

/// Process-wide byte counters.
#[derive(Debug, Default)]
pub struct Stats {
    /// Bytes sent towards targets.
    tx: AtomicU64,
    /// Bytes received from targets.
    rx: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub tx: u64,
    pub rx: u64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_tx(&self, n: u64) {
        self.tx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx(&self, n: u64) {
        self.rx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn tx(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }

    pub fn rx(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx: self.tx(),
            rx: self.rx(),
        }
    }
}

/// Which counter a copy loop feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl Direction {
    fn record(self, stats: &Stats, n: usize) {
        match self {
            Direction::Tx => stats.add_tx(n as u64),
            Direction::Rx => stats.add_rx(n as u64),
        }
    }
}

/// A pool of fixed-size byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_kb` KiB (minimum 1).
    pub fn new(buffer_kb: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_kb.max(1) * 1024,
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer from the pool, allocating if none is free.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, buf: Vec<u8>) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < MAX_IDLE_BUFFERS {
                free.push(buf);
            }
        }
    }

    /// Number of buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_KB * 1024,
            free: Mutex::new(Vec::new()),
        }
    }
}

/// A buffer on loan from a [`BufferPool`]; returned when dropped.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Copy `reader` into `writer` until EOF, counting every byte written.
///
/// Returns the number of bytes copied. Cancellation ends the copy early and
/// is reported as [`Error::Cancelled`].
pub async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffers: &Arc<BufferPool>,
    stats: &Stats,
    direction: Direction,
    token: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = buffers.get();
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            written = writer.write_all(&buf[..n]) => written?,
        }
        direction.record(stats, n);
        total += n as u64;
    }

    writer.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let stats = Stats::new();
        stats.add_tx(10);
        stats.add_rx(3);
        stats.add_rx(4);
        assert_eq!(stats.snapshot(), StatsSnapshot { tx: 10, rx: 7 });
    }

    #[test]
    fn test_buffer_returns_to_pool() {
        let pool = BufferPool::new(4);
        {
            let buf = pool.get();
            assert_eq!(buf.len(), 4096);
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);

        // The returned buffer is handed out again.
        let _buf = pool.get();
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn test_copy_counted_until_eof() {
        let pool = BufferPool::new(1);
        let stats = Stats::new();
        let token = CancellationToken::new();

        let data = vec![7u8; 5000];
        let mut reader = data.as_slice();
        let mut out = Vec::new();

        let n = copy_counted(&mut reader, &mut out, &pool, &stats, Direction::Tx, &token)
            .await
            .unwrap();

        assert_eq!(n, 5000);
        assert_eq!(out, data);
        assert_eq!(stats.tx(), 5000);
        assert_eq!(stats.rx(), 0);
    }

    #[tokio::test]
    async fn test_copy_counted_observes_cancellation() {
        let pool = BufferPool::new(1);
        let stats = Stats::new();
        let token = CancellationToken::new();

        // A reader that never yields data.
        let (_keep_open, mut reader) = tokio::io::duplex(64);
        let mut out = Vec::new();

        token.cancel();
        let err = copy_counted(&mut reader, &mut out, &pool, &stats, Direction::Rx, &token)
            .await
            .unwrap_err();
        assert!(err.is_clean_close());
    }
}
