use std::sync::Arc;

use burrow_proto::tunnel::v1::{server_frame, ClientFrame, FrameStatus, ServerFrame, TunnelClient};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::Streaming;
use tracing::debug;

use super::{settle, AddrPublisher, Request};
use crate::error::{Error, Result};
use crate::pool::ConnLease;
use crate::stats::{BufferPool, Stats};

/// Outbound frames buffered ahead of the HTTP/2 flow-control window.
const OUTBOUND_FRAMES: usize = 16;

/// Egress that tunnels the session over a pooled RPC channel.
#[derive(Debug)]
pub struct RpcClient {
    lease: ConnLease,
    user_id: String,
    stats: Arc<Stats>,
    buffers: Arc<BufferPool>,
}

impl RpcClient {
    pub fn new(lease: ConnLease, user_id: String, stats: Arc<Stats>, buffers: Arc<BufferPool>) -> Self {
        Self {
            lease,
            user_id,
            stats,
            buffers,
        }
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
        let (tx, rx) = mpsc::channel(OUTBOUND_FRAMES);
        let header = ClientFrame::header(self.user_id.as_str(), request.host.as_str(), request.port);
        if tx.send(header).await.is_err() {
            publisher.fail();
            return Err(Error::Cancelled);
        }

        let mut client = TunnelClient::new(self.lease.channel());
        let inbound = match client.proxy(ReceiverStream::new(rx)).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                let err = Error::from(status);
                if err.is_channel_failure() {
                    self.lease.mark_failed();
                }
                publisher.fail();
                return Err(err);
            }
        };
        self.lease.mark_ready();
        debug!(
            conn_id = self.lease.conn().id(),
            target = %request,
            "Tunnel stream opened"
        );

        let session = token.child_token();

        let upstream = async {
            let result = self.send_loop(src, tx, &session).await;
            if result.is_err() {
                session.cancel();
            }
            result
        };

        let downstream = async {
            let result = self.recv_loop(inbound, &mut publisher, dst, &session).await;
            // Once the server is done there is nothing left to relay.
            session.cancel();
            result
        };

        let (up, down) = tokio::join!(upstream, downstream);
        // Never leave the front-end waiting on a stream that died early.
        publisher.fail();
        settle(up, down)
    }

    /// Wrap every chunk read from `src` into a payload frame. On EOF a
    /// zero-length payload tells the server to half-close the target, and
    /// dropping `tx` ends the request stream.
    async fn send_loop<R>(
        &self,
        src: &mut R,
        tx: mpsc::Sender<ClientFrame>,
        session: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = self.buffers.get();
        loop {
            let n = tokio::select! {
                _ = session.cancelled() => return Err(Error::Cancelled),
                read = src.read(&mut buf) => read?,
            };

            let frame = if n == 0 {
                ClientFrame::eof()
            } else {
                ClientFrame::payload(Bytes::copy_from_slice(&buf[..n]))
            };
            let sent = tokio::select! {
                _ = session.cancelled() => return Err(Error::Cancelled),
                sent = tx.send(frame) => sent,
            };
            if sent.is_err() {
                // The call is gone. Leave the receive side running so it can
                // report the server's status.
                return Ok(());
            }

            if n == 0 {
                return Ok(());
            }
            self.stats.add_tx(n as u64);
        }
    }

    async fn recv_loop<W>(
        &self,
        mut inbound: Streaming<ServerFrame>,
        publisher: &mut AddrPublisher,
        dst: &mut W,
        session: &CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            let frame = tokio::select! {
                _ = session.cancelled() => return Err(Error::Cancelled),
                frame = inbound.next() => frame,
            };
            let frame = match frame {
                Some(frame) => frame?,
                None => return Ok(()),
            };

            match (frame.status(), frame.kind) {
                (FrameStatus::Accepted, Some(server_frame::Kind::Header(header))) => {
                    debug!(addr = %header.addr, "Tunnel accepted");
                    publisher.publish(header.addr);
                }
                (FrameStatus::Session, Some(server_frame::Kind::Payload(payload))) => {
                    tokio::select! {
                        _ = session.cancelled() => return Err(Error::Cancelled),
                        written = write_payload(dst, &payload.data) => written?,
                    }
                    self.stats.add_rx(payload.data.len() as u64);
                }
                (FrameStatus::Eof, _) => {
                    dst.flush().await?;
                    return Ok(());
                }
                (FrameStatus::Error, _) => {
                    publisher.fail();
                    return Err(Error::RemoteError);
                }
                _ => return Err(Error::InvalidMessage),
            }
        }
    }

    /// Give the pooled connection back.
    pub fn close(self) -> Result<()> {
        self.lease.release();
        Ok(())
    }
}

/// Write one payload to `dst`. A writer that stops accepting bytes midway
/// is reported as packet loss.
async fn write_payload<W>(dst: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut written = 0;
    while written < data.len() {
        let n = dst.write(&data[written..]).await?;
        if n == 0 {
            return Err(Error::PacketLoss {
                written,
                expected: data.len(),
            });
        }
        written += n;
    }
    Ok(())
}
