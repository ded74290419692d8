//! Egress transports.
//!
//! A [`Transport`] is the handler chosen for one proxied connection. Every
//! variant exposes the same capability set: a display name, a raw `dial`,
//! a full bidirectional `proxy` session and `close`.
//!
//! ```text
//! front-end -> RouteEngine::get_route -> Transport::proxy(dst, src)
//!                                            |
//!                     Direct | Blackhole | Forward | Rpc (pooled channel)
//! ```

mod blackhole;
mod direct;
mod forward;
mod rpc;

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

pub use blackhole::{Blackhole, BLACKHOLE_ADDR};
pub use direct::{dial_tcp, Direct, DEFAULT_CONNECT_TIMEOUT};
pub use forward::{Forward, Upstream};
pub use rpc::RpcClient;

/// Target of a proxied connection, as parsed by a front-end.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub host: String,
    pub port: u16,
}

impl Request {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        match self.host.parse::<Ipv6Addr>() {
            Ok(_) => format!("[{}]:{}", self.host, self.port),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Address families a dial may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// IPv4 and IPv6.
    #[default]
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl Network {
    /// Dual-stack when IPv6 is enabled, IPv4 only otherwise.
    pub fn from_ipv6(enabled: bool) -> Self {
        if enabled {
            Network::Tcp
        } else {
            Network::Tcp4
        }
    }

    pub fn permits(self, ip: IpAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => ip.is_ipv4(),
            Network::Tcp6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Tcp4 => f.write_str("tcp4"),
            Network::Tcp6 => f.write_str("tcp6"),
        }
    }
}

/// Create the one-shot channel a transport uses to hand the bound local
/// address back to the front-end.
pub fn addr_channel() -> (AddrPublisher, AddrReceiver) {
    let (tx, rx) = oneshot::channel();
    (AddrPublisher { tx: Some(tx) }, AddrReceiver { rx })
}

/// Sending side of [`addr_channel`]. Publishes at most once; dropping it
/// without publishing closes the channel, which the front-end reads as a
/// failed connection.
#[derive(Debug)]
pub struct AddrPublisher {
    tx: Option<oneshot::Sender<String>>,
}

impl AddrPublisher {
    /// Publish the established address. Returns false if an address (or a
    /// failure) was already published.
    pub fn publish(&mut self, addr: impl Into<String>) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(addr.into());
                true
            }
            None => false,
        }
    }

    /// Publish an empty address, unless something was already published.
    pub fn fail(&mut self) {
        self.publish(String::new());
    }

    pub fn is_published(&self) -> bool {
        self.tx.is_none()
    }
}

/// Receiving side of [`addr_channel`].
#[derive(Debug)]
pub struct AddrReceiver {
    rx: oneshot::Receiver<String>,
}

impl AddrReceiver {
    /// Wait for the transport's verdict. `None` means the connection could
    /// not be established (empty address or closed channel).
    pub async fn established(self) -> Option<String> {
        match self.rx.await {
            Ok(addr) if !addr.is_empty() => Some(addr),
            _ => None,
        }
    }
}

/// The egress chosen for one connection.
#[derive(Debug)]
pub enum Transport {
    Direct(Direct),
    Blackhole(Blackhole),
    Forward(Forward),
    Rpc(RpcClient),
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Direct(_) => "direct",
            Transport::Blackhole(_) => "blackhole",
            Transport::Forward(_) => "forward",
            Transport::Rpc(_) => "rpc",
        }
    }

    /// Open a raw connection to `addr` (`host:port`).
    pub async fn dial(&self, network: Network, addr: &str) -> Result<TcpStream> {
        match self {
            Transport::Direct(t) => t.dial(network, addr).await,
            Transport::Forward(t) => t.dial(addr).await,
            Transport::Blackhole(_) | Transport::Rpc(_) => {
                Err(Error::NotImplemented(format!("{} dial", self.name())))
            }
        }
    }

    /// Run a full proxy session: establish the egress, publish the bound
    /// address, then relay `src` to the target and the target to `dst` until
    /// either side finishes or `token` is cancelled.
    pub async fn proxy<R, W>(
        &self,
        token: &CancellationToken,
        request: &Request,
        publisher: AddrPublisher,
        dst: &mut W,
        src: &mut R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        debug!(transport = self.name(), target = %request, "Proxy session starting");
        match self {
            Transport::Direct(t) => t.proxy(token, request, publisher, dst, src).await,
            Transport::Blackhole(t) => t.proxy(token, publisher, src).await,
            Transport::Forward(t) => t.proxy(publisher).await,
            Transport::Rpc(t) => t.proxy(token, request, publisher, dst, src).await,
        }
    }

    /// Release whatever the transport holds. Process-wide transports hold
    /// nothing; an RPC transport returns its connection to the pool.
    pub fn close(self) -> Result<()> {
        match self {
            Transport::Rpc(t) => t.close(),
            Transport::Direct(_) | Transport::Blackhole(_) | Transport::Forward(_) => Ok(()),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Combine the results of a session's two copy loops: the first error that
/// is not a clean close wins.
pub(crate) fn settle(upstream: Result<()>, downstream: Result<()>) -> Result<()> {
    for result in [upstream, downstream] {
        if let Err(e) = result {
            if !e.is_clean_close() {
                return Err(e);
            }
        }
    }
    Ok(())
}
