//! Server side of the tunnel protocol.
//!
//! Every `Proxy` stream becomes one [`Session`]:
//!
//! ```text
//! client ── Header ──► handshake: user allowlist, route, dial (3 min)
//!        ◄── Accepted{addr}
//!        ── Payload ──► target        (empty payload: half-close target)
//!        ◄── Session{payload} ── target
//!        ◄── Eof                       (best effort, after both loops)
//! ```
//!
//! The handler returns the response stream immediately and runs the session
//! in its own task, so the handshake never blocks the HTTP/2 connection.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burrow_proto::tunnel::v1::{client_frame, ClientFrame, ServerFrame, Tunnel, TunnelServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn, Instrument};

use crate::error::{Error, Result};
use crate::route::RouteEngine;
use crate::stats::{BufferPool, Stats};
use crate::transport::{settle, Network, Request as Target};

/// How long the handshake may spend dialing the target.
pub const HANDSHAKE_DIAL_TIMEOUT: Duration = Duration::from_secs(180);

/// Frames buffered towards the client per stream.
const OUTBOUND_FRAMES: usize = 16;

type FrameSender = mpsc::Sender<std::result::Result<ServerFrame, Status>>;

/// Implementation of the generated `Tunnel` service.
#[derive(Debug, Clone)]
pub struct TunnelService {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    users: HashSet<String>,
    routes: Arc<RouteEngine>,
    network: Network,
    stats: Arc<Stats>,
    buffers: Arc<BufferPool>,
    dial_timeout: Duration,
    shutdown: CancellationToken,
    active: AtomicUsize,
}

impl TunnelService {
    /// `shutdown` cancels every running session when triggered.
    pub fn new(
        users: HashSet<String>,
        routes: Arc<RouteEngine>,
        network: Network,
        buffers: Arc<BufferPool>,
        shutdown: CancellationToken,
    ) -> Self {
        let stats = Arc::clone(routes.factory().stats());
        Self {
            inner: Arc::new(Shared {
                users,
                routes,
                network,
                stats,
                buffers,
                dial_timeout: HANDSHAKE_DIAL_TIMEOUT,
                shutdown,
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Sessions whose task has not finished yet.
    pub fn active_sessions(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn into_server(self) -> TunnelServer<Self> {
        TunnelServer::new(self)
    }
}

#[tonic::async_trait]
impl Tunnel for TunnelService {
    type ProxyStream = ReceiverStream<std::result::Result<ServerFrame, Status>>;

    async fn proxy(
        &self,
        request: Request<Streaming<ClientFrame>>,
    ) -> std::result::Result<Response<Self::ProxyStream>, Status> {
        let peer = request.remote_addr();
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(OUTBOUND_FRAMES);

        let session = Session::new(Arc::clone(&self.inner));
        let span = tracing::info_span!(
            "tunnel",
            peer = %peer.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string())
        );
        tokio::spawn(session.run(inbound, tx).instrument(span));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// One proxied stream on the server.
struct Session {
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl Session {
    fn new(shared: Arc<Shared>) -> Self {
        shared.active.fetch_add(1, Ordering::Relaxed);
        let token = shared.shutdown.child_token();
        Self { shared, token }
    }

    async fn run(self, mut inbound: Streaming<ClientFrame>, tx: FrameSender) {
        let (target, user_id, local_addr) = match self.handshake(&mut inbound, &tx).await {
            Ok(established) => established,
            Err(e) => {
                if e.is_clean_close() {
                    debug!(error = %e, "Tunnel closed during handshake");
                } else {
                    warn!(error = %e, "Tunnel handshake failed");
                }
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };
        info!(user = %user_id, local_addr = %local_addr, "Tunnel established");

        let result = self.relay(inbound, target, &tx, local_addr).await;
        match &result {
            Ok(()) => debug!("Tunnel finished"),
            Err(e) if e.is_clean_close() => debug!(error = %e, "Tunnel closed"),
            Err(e) => warn!(error = %e, "Tunnel failed"),
        }

        let _ = tx.try_send(Ok(ServerFrame::eof()));
    }

    /// Read the header, authorize the user, pick a route and dial the
    /// target. Returns the connected target.
    async fn handshake(
        &self,
        inbound: &mut Streaming<ClientFrame>,
        tx: &FrameSender,
    ) -> Result<(TcpStream, String, SocketAddr)> {
        let first = tokio::select! {
            _ = self.token.cancelled() => return Err(Error::Cancelled),
            _ = tx.closed() => return Err(Error::Cancelled),
            first = inbound.message() => first?,
        };
        let header = match first.and_then(|frame| frame.kind) {
            Some(client_frame::Kind::Header(header)) => header,
            _ => return Err(Error::InvalidMessage),
        };

        if !self.shared.users.contains(&header.user_id) {
            return Err(Error::UserNotFound(header.user_id));
        }
        let port = u16::try_from(header.port).map_err(|_| Error::InvalidMessage)?;
        let target = Target::new(header.fqdn, port);

        let transport = self.shared.routes.get_route(&target.host).await?;
        debug!(target = %target, transport = %transport, "Dialing target");

        let authority = target.authority();
        let dialed = tokio::select! {
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = tx.closed() => Err(Error::Cancelled),
            dialed = timeout(
                self.shared.dial_timeout,
                transport.dial(self.shared.network, &authority),
            ) => dialed.unwrap_or_else(|_| Err(Error::DialTimeout(authority.clone()))),
        };
        transport.close()?;

        let stream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.send(Ok(ServerFrame::error())).await;
                return Err(e);
            }
        };
        let local_addr = stream.local_addr()?;
        Ok((stream, header.user_id, local_addr))
    }

    async fn relay(
        &self,
        inbound: Streaming<ClientFrame>,
        target: TcpStream,
        tx: &FrameSender,
        local_addr: SocketAddr,
    ) -> Result<()> {
        let (mut target_read, mut target_write) = target.into_split();

        let upstream = async {
            let result = self.client_to_target(inbound, &mut target_write).await;
            if result.is_err() {
                self.token.cancel();
            }
            result
        };

        let downstream = async {
            let result = self.target_to_client(&mut target_read, tx, local_addr).await;
            self.token.cancel();
            result
        };

        let (up, down) = tokio::join!(upstream, downstream);
        // Both halves drop here, closing the target exactly once.
        drop((target_read, target_write));
        settle(up, down)
    }

    async fn client_to_target(
        &self,
        mut inbound: Streaming<ClientFrame>,
        target: &mut OwnedWriteHalf,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => return Err(Error::Cancelled),
                frame = inbound.message() => frame?,
            };
            let payload = match frame.and_then(|frame| frame.kind) {
                Some(client_frame::Kind::Payload(payload)) => payload,
                Some(client_frame::Kind::Header(_)) => return Err(Error::InvalidMessage),
                // Client closed its half without the empty payload.
                None => {
                    let _ = target.shutdown().await;
                    return Ok(());
                }
            };

            if payload.data.is_empty() {
                debug!("Client finished sending");
                let _ = target.shutdown().await;
                return Ok(());
            }

            tokio::select! {
                _ = self.token.cancelled() => return Err(Error::Cancelled),
                written = write_target(target, &payload.data) => written?,
            }
            self.shared.stats.add_tx(payload.data.len() as u64);
        }
    }

    async fn target_to_client(
        &self,
        target: &mut OwnedReadHalf,
        tx: &FrameSender,
        local_addr: SocketAddr,
    ) -> Result<()> {
        send(tx, ServerFrame::accepted(local_addr.to_string()), &self.token).await?;

        let mut buf = self.shared.buffers.get();
        loop {
            // A dropped response stream means the client is gone.
            let n = tokio::select! {
                _ = self.token.cancelled() => return Err(Error::Cancelled),
                _ = tx.closed() => return Err(Error::Cancelled),
                read = target.read(&mut buf) => read?,
            };
            if n == 0 {
                return Ok(());
            }
            send(
                tx,
                ServerFrame::session(bytes::Bytes::copy_from_slice(&buf[..n])),
                &self.token,
            )
            .await?;
            self.shared.stats.add_rx(n as u64);
        }
    }
}

async fn send(tx: &FrameSender, frame: ServerFrame, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        _ = tx.closed() => Err(Error::Cancelled),
        sent = tx.send(Ok(frame)) => sent.map_err(|_| Error::Cancelled),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Write a whole payload to the target; a writer that stops accepting bytes
/// is a short write.
async fn write_target(target: &mut OwnedWriteHalf, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        let n = target.write(&data[written..]).await?;
        if n == 0 {
            return Err(Error::ShortWrite);
        }
        written += n;
    }
    Ok(())
}
