use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::AddrPublisher;
use crate::error::Result;
use crate::stats::{BufferPool, Stats};

/// Address reported for blackholed connections.
pub const BLACKHOLE_ADDR: &str = "127.0.0.1:0";

/// Sink egress: accepts the connection and swallows everything it sends.
#[derive(Debug, Clone)]
pub struct Blackhole {
    stats: Arc<Stats>,
    buffers: Arc<BufferPool>,
}

impl Blackhole {
    pub fn new(stats: Arc<Stats>, buffers: Arc<BufferPool>) -> Self {
        Self { stats, buffers }
    }

    /// Drain `src` until EOF or cancellation. Nothing is ever written back.
    pub(super) async fn proxy<R>(
        &self,
        token: &CancellationToken,
        mut publisher: AddrPublisher,
        src: &mut R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        publisher.publish(BLACKHOLE_ADDR);

        let mut buf = self.buffers.get();
        loop {
            let n = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                read = src.read(&mut buf) => read?,
            };
            if n == 0 {
                return Ok(());
            }
            self.stats.add_rx(n as u64);
        }
    }
}
