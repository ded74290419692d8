//! Per-connection orchestration between a front-end and a transport.
//!
//! The transport writes target bytes into an in-memory pipe. The front half
//! waits for the transport to publish its bound address, writes the
//! protocol's reply (success or failure) to the client, and only then starts
//! draining the pipe, so the reply always precedes payload bytes.

use std::time::Duration;

use burrow_core::{addr_channel, Request, Result, Transport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Replies a front-end sends once the transport has decided.
pub trait Reply: Send + Sync {
    /// Bytes written before streaming starts. `bound` is the address the
    /// transport published.
    fn established(&self, bound: &str) -> Vec<u8>;

    /// Bytes written when the connection could not be established.
    fn failed(&self) -> Vec<u8>;
}

/// How the session ended from the client's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Established(String),
    Failed,
}

/// Run one proxied connection: `src` feeds the target, target bytes reach
/// `client` after the reply.
pub async fn relay<R, W>(
    transport: &Transport,
    token: &CancellationToken,
    request: &Request,
    src: &mut R,
    client: &mut W,
    reply: &dyn Reply,
    pipe_size: usize,
) -> Result<Outcome>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let session = token.child_token();
    let (publisher, receiver) = addr_channel();
    let (inner, outer) = tokio::io::duplex(pipe_size.max(1024));
    let (mut outer_read, _outer_write) = tokio::io::split(outer);

    let proxy = async {
        let mut inner = inner;
        let result = transport
            .proxy(&session, request, publisher, &mut inner, src)
            .await;
        // Closing the pipe lets the front half finish draining.
        let _ = inner.shutdown().await;
        drop(inner);
        result
    };

    let front = async {
        let outcome = match receiver.established().await {
            Some(bound) => {
                debug!(bound = %bound, "Connection established");
                client.write_all(&reply.established(&bound)).await?;
                Outcome::Established(bound)
            }
            None => {
                client.write_all(&reply.failed()).await?;
                client.flush().await?;
                return Ok(Outcome::Failed);
            }
        };

        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = tokio::select! {
                _ = session.cancelled() => break,
                read = outer_read.read(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }
            client.write_all(&buf[..n]).await?;
        }
        client.flush().await?;
        Ok::<_, std::io::Error>(outcome)
    };

    let front = async {
        let result = front.await;
        if result.is_err() {
            // The client is gone; stop the transport too.
            session.cancel();
        }
        result
    };

    let (proxied, outcome) = tokio::join!(proxy, front);
    let outcome = outcome?;
    match (proxied, &outcome) {
        (Ok(()), _) => Ok(outcome),
        (Err(e), _) if e.is_clean_close() => Ok(outcome),
        // The failure reply already told the client.
        (Err(e), Outcome::Failed) => {
            debug!(error = %e, "Transport failed before establishing");
            Ok(outcome)
        }
        (Err(e), Outcome::Established(_)) => Err(e),
    }
}

/// Race `relay` against a hard session cap.
#[allow(clippy::too_many_arguments)]
pub async fn relay_capped<R, W>(
    cap: Duration,
    transport: &Transport,
    token: &CancellationToken,
    request: &Request,
    src: &mut R,
    client: &mut W,
    reply: &dyn Reply,
    pipe_size: usize,
) -> Result<Outcome>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let capped = token.child_token();
    let session = relay(transport, &capped, request, src, client, reply, pipe_size);
    tokio::pin!(session);

    tokio::select! {
        result = &mut session => result,
        _ = tokio::time::sleep(cap) => {
            debug!(cap_secs = cap.as_secs(), "Session cap reached");
            capped.cancel();
            session.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::transport::Blackhole;
    use burrow_core::{BufferPool, Stats};
    use std::sync::Arc;

    struct Fixed;

    impl Reply for Fixed {
        fn established(&self, bound: &str) -> Vec<u8> {
            format!("OK {bound}\n").into_bytes()
        }

        fn failed(&self) -> Vec<u8> {
            b"FAIL\n".to_vec()
        }
    }

    #[tokio::test]
    async fn test_relay_writes_reply_first() {
        let stats = Stats::new();
        let transport = Transport::Blackhole(Blackhole::new(Arc::clone(&stats), BufferPool::new(1)));
        let mut src: &[u8] = b"discarded";
        let mut client = Vec::new();

        let outcome = relay(
            &transport,
            &CancellationToken::new(),
            &Request::new("sink.test", 80),
            &mut src,
            &mut client,
            &Fixed,
            4096,
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Established("127.0.0.1:0".to_string()));
        assert_eq!(client, b"OK 127.0.0.1:0\n");
        assert_eq!(stats.rx(), 9);
    }

    #[tokio::test]
    async fn test_relay_failure_reply() {
        let direct = burrow_core::transport::Direct::new(
            Stats::new(),
            BufferPool::new(1),
            burrow_core::Network::Tcp,
        );
        let transport = Transport::Direct(direct);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut src: &[u8] = b"";
        let mut client = Vec::new();
        let outcome = relay(
            &transport,
            &CancellationToken::new(),
            &Request::new("127.0.0.1", port),
            &mut src,
            &mut client,
            &Fixed,
            4096,
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(client, b"FAIL\n");
    }

    #[tokio::test]
    async fn test_relay_capped_stops_idle_session() {
        let transport = Transport::Blackhole(Blackhole::new(Stats::new(), BufferPool::new(1)));
        // A source that stays open.
        let (_keep_open, mut src) = tokio::io::duplex(64);
        let mut client = Vec::new();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            relay_capped(
                Duration::from_millis(50),
                &transport,
                &CancellationToken::new(),
                &Request::new("sink.test", 80),
                &mut src,
                &mut client,
                &Fixed,
                4096,
            ),
        )
        .await
        .expect("cap did not end the session")
        .unwrap();

        assert_eq!(outcome, Outcome::Established("127.0.0.1:0".to_string()));
    }
}
