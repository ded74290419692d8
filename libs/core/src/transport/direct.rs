use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{settle, AddrPublisher, Network, Request};
use crate::error::{Error, Result};
use crate::stats::{copy_counted, BufferPool, Direction, Stats};

/// Default connect timeout for direct dials.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials targets straight from this host.
#[derive(Debug, Clone)]
pub struct Direct {
    stats: Arc<Stats>,
    buffers: Arc<BufferPool>,
    network: Network,
    connect_timeout: Duration,
}

impl Direct {
    pub fn new(stats: Arc<Stats>, buffers: Arc<BufferPool>, network: Network) -> Self {
        Self {
            stats,
            buffers,
            network,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub async fn dial(&self, network: Network, addr: &str) -> Result<TcpStream> {
        dial_tcp(network, addr, self.connect_timeout).await
    }

    pub(super) async fn proxy<R, W>(
        &self,
        token: &CancellationToken,
        request: &Request,
        mut publisher: AddrPublisher,
        dst: &mut W,
        src: &mut R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let target = match self.dial(self.network, &request.authority()).await {
            Ok(target) => target,
            Err(e) => {
                publisher.fail();
                return Err(e);
            }
        };

        let local_addr = target.local_addr()?;
        publisher.publish(local_addr.to_string());
        debug!(target = %request, local_addr = %local_addr, "Direct connection established");

        let (mut target_read, mut target_write) = target.into_split();
        let session = token.child_token();

        let upstream = async {
            let result = copy_counted(
                src,
                &mut target_write,
                &self.buffers,
                &self.stats,
                Direction::Tx,
                &session,
            )
            .await;
            match result {
                // Half-close: the target may still be answering.
                Ok(_) => {
                    let _ = target_write.shutdown().await;
                    Ok(())
                }
                Err(e) => {
                    session.cancel();
                    Err(e)
                }
            }
        };

        let downstream = async {
            let result = copy_counted(
                &mut target_read,
                dst,
                &self.buffers,
                &self.stats,
                Direction::Rx,
                &session,
            )
            .await;
            // Once the target is done there is nothing left to relay.
            session.cancel();
            result.map(|_| ())
        };

        let (up, down) = tokio::join!(upstream, downstream);
        settle(up, down)
    }
}

/// Resolve `addr` and connect to the first address permitted by `network`,
/// bounded by `connect_timeout` overall.
pub async fn dial_tcp(network: Network, addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let attempt = async {
        let mut last_err = None;
        for candidate in lookup_host(addr).await? {
            if !network.permits(candidate.ip()) {
                continue;
            }
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for {}", network, addr),
            )
        }))
    };

    match timeout(connect_timeout, attempt).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(Error::Dial {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(Error::DialTimeout(addr.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::addr_channel;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_tcp4_rejects_v6_only_target() {
        let err = dial_tcp(Network::Tcp4, "[::1]:9", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dial { .. }));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dial_tcp(Network::Tcp, &addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dial { .. }));
    }

    #[tokio::test]
    async fn test_direct_proxy_roundtrip_counts_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = listener.local_addr().unwrap();

        // Echo one message back, then close.
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
        });

        let stats = Stats::new();
        let direct = Direct::new(Arc::clone(&stats), BufferPool::new(1), Network::Tcp);
        let request = Request::new("127.0.0.1", target_addr.port());
        let (publisher, receiver) = addr_channel();

        let mut src: &[u8] = b"ping";
        let mut dst = Vec::new();
        let token = CancellationToken::new();

        direct
            .proxy(&token, &request, publisher, &mut dst, &mut src)
            .await
            .unwrap();

        assert_eq!(dst, b"ping");
        assert!(receiver.established().await.is_some());
        assert_eq!(stats.tx(), 4);
        assert_eq!(stats.rx(), 4);
    }

    #[tokio::test]
    async fn test_direct_proxy_dial_failure_publishes_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let direct = Direct::new(Stats::new(), BufferPool::new(1), Network::Tcp);
        let (publisher, receiver) = addr_channel();
        let mut src: &[u8] = b"";
        let mut dst = Vec::new();

        let result = direct
            .proxy(
                &CancellationToken::new(),
                &Request::new("127.0.0.1", port),
                publisher,
                &mut dst,
                &mut src,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(receiver.established().await, None);
    }
}
