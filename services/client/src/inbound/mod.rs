//! Local proxy listeners.
//!
//! Each listener accepts TCP connections, speaks one front-end protocol
//! (SOCKS5 or HTTP), asks the route engine for a transport and hands the
//! connection to [`session::relay`].

pub mod http;
pub mod socks5;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burrow_core::{Error, Result, RouteEngine, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::session::{self, Outcome, Reply};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Front-end protocol spoken by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks5,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Socks5 => f.write_str("socks5"),
            Protocol::Http => f.write_str("http"),
        }
    }
}

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    pub protocol: Protocol,
    pub max_connections: usize,
    /// Size of the in-memory pipe between transport and client.
    pub pipe_size: usize,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr, protocol: Protocol, pipe_size: usize) -> Self {
        Self {
            bind_addr,
            protocol,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            pipe_size,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Destinations refused by a block route.
    pub routes_blocked: AtomicU64,
    /// Route lookups that failed for any other reason.
    pub routes_failed: AtomicU64,
    /// Transports that never published a bound address.
    pub establish_failed: AtomicU64,
}

/// A bound front-end listener.
pub struct Inbound {
    config: ListenerConfig,
    listener: TcpListener,
    routes: Arc<RouteEngine>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
    shutdown: CancellationToken,
}

impl Inbound {
    /// Bind the listener. `shutdown` stops the accept loop and cancels every
    /// running session.
    pub async fn bind(
        config: ListenerConfig,
        routes: Arc<RouteEngine>,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            protocol = %config.protocol,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            routes,
            stats: Arc::new(ListenerStats::default()),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until shutdown.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, protocol = %self.config.protocol, "Listener started");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(bind_addr = %local_addr, "Listener stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream).await {
                                if e.is_clean_close() {
                                    debug!(error = %e, "Connection closed");
                                } else {
                                    debug!(error = %e, "Connection error");
                                }
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            peer = %peer_addr,
                            protocol = %self.config.protocol
                        )),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let _ = stream.set_nodelay(true);
        match self.config.protocol {
            Protocol::Socks5 => self.handle_socks5(stream).await,
            Protocol::Http => self.handle_http(stream).await,
        }
    }

    async fn handle_socks5(&self, mut stream: TcpStream) -> Result<()> {
        let request = socks5::handshake(&mut stream).await?;

        let transport = match self.routes.get_route(&request.host).await {
            Ok(transport) => transport,
            Err(e) => {
                let code = if self.note_route_failure(&e) {
                    socks5::ReplyCode::NotAllowed
                } else {
                    socks5::ReplyCode::NetworkUnreachable
                };
                stream.write_all(&socks5::encode_reply(code, None)).await?;
                return self.route_result(e);
            }
        };
        debug!(target = %request, transport = %transport, "Route selected");

        let (mut read, mut write) = stream.split();
        let result = session::relay(
            &transport,
            &self.shutdown,
            &request,
            &mut read,
            &mut write,
            &socks5::ConnectReply,
            self.config.pipe_size,
        )
        .await;
        self.finish(transport, result)
    }

    async fn handle_http(&self, mut stream: TcpStream) -> Result<()> {
        let (head, rest) = http::read_head(&mut stream).await?;
        let proxy_request = match http::parse_request(&head) {
            Ok(request) => request,
            Err(e) => {
                stream.write_all(http::RESPONSE_BAD_REQUEST).await?;
                return Err(e.into());
            }
        };
        let target = proxy_request.target().clone();

        let transport = match self.routes.get_route(&target.host).await {
            Ok(transport) => transport,
            Err(e) => {
                let response = if self.note_route_failure(&e) {
                    http::RESPONSE_FORBIDDEN
                } else {
                    http::RESPONSE_UNAVAILABLE
                };
                stream.write_all(response).await?;
                return self.route_result(e);
            }
        };
        debug!(target = %target, transport = %transport, "Route selected");

        // Bytes already read past the head go to the target first.
        let (reply, prelude): (&dyn Reply, Vec<u8>) = match proxy_request {
            http::ProxyRequest::Connect(_) => (&http::ConnectReply, rest),
            http::ProxyRequest::Forward { mut head, .. } => {
                head.extend_from_slice(&rest);
                (&http::ForwardReply, head)
            }
        };

        let (read, mut write) = stream.split();
        let mut src = prelude.as_slice().chain(read);
        let result = session::relay_capped(
            http::HTTP_SESSION_CAP,
            &transport,
            &self.shutdown,
            &target,
            &mut src,
            &mut write,
            reply,
            self.config.pipe_size,
        )
        .await;
        self.finish(transport, result)
    }

    /// Count a failed route lookup. Returns true when the destination was
    /// blocked by policy.
    fn note_route_failure(&self, e: &Error) -> bool {
        if matches!(e, Error::Unimplemented) {
            self.stats.routes_blocked.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.stats.routes_failed.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn route_result(&self, e: Error) -> Result<()> {
        match e {
            Error::Unimplemented => {
                debug!("Destination blocked by route");
                Ok(())
            }
            e => {
                warn!(error = %e, "Route lookup failed");
                Err(e)
            }
        }
    }

    fn finish(&self, transport: Transport, result: Result<Outcome>) -> Result<()> {
        let closed = transport.close();
        match result? {
            Outcome::Established(bound) => debug!(bound = %bound, "Session finished"),
            Outcome::Failed => {
                self.stats.establish_failed.fetch_add(1, Ordering::Relaxed);
                debug!("Session failed to establish");
            }
        }
        closed
    }
}
