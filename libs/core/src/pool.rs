//! RPC channel pool.
//!
//! The client multiplexes proxy sessions over a fixed set of long-lived
//! HTTP/2 channels to the server. With a pool size of zero the pool instead
//! dials a fresh channel for every checkout and closes it on release.
//!
//! ```text
//! get_conn() ──► least in-use (ties: least recently used) ──► ConnLease
//!                     │                                          │
//!                     └── unhealthy? reset backoff               └── drop: in_use -= 1
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default timeout for establishing one channel.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default HTTP/2 keepalive ping interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Build the endpoint every pooled channel dials. `server_addr` may omit the
/// scheme; it is derived from whether TLS is configured.
pub fn build_endpoint(server_addr: &str, tls: Option<ClientTlsConfig>) -> Result<Endpoint> {
    let uri = if server_addr.contains("://") {
        server_addr.to_string()
    } else if tls.is_some() {
        format!("https://{server_addr}")
    } else {
        format!("http://{server_addr}")
    };

    let mut endpoint = Endpoint::from_shared(uri)?
        .connect_timeout(DEFAULT_DIAL_TIMEOUT)
        .tcp_nodelay(true)
        .tcp_keepalive(Some(DEFAULT_KEEPALIVE_INTERVAL))
        .http2_keep_alive_interval(DEFAULT_KEEPALIVE_INTERVAL)
        .keep_alive_while_idle(true);

    if let Some(tls) = tls {
        endpoint = endpoint.tls_config(tls)?;
    }
    Ok(endpoint)
}

/// Connectivity state of one pooled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    TransientFailure = 3,
    Shutdown = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Idle,
            1 => ConnState::Connecting,
            2 => ConnState::Ready,
            3 => ConnState::TransientFailure,
            _ => ConnState::Shutdown,
        }
    }

    /// Connecting and ready channels are handed out as-is.
    pub fn is_healthy(self) -> bool {
        matches!(self, ConnState::Connecting | ConnState::Ready)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Idle => "IDLE",
            ConnState::Connecting => "CONNECTING",
            ConnState::Ready => "READY",
            ConnState::TransientFailure => "TRANSIENT_FAILURE",
            ConnState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// One channel to the server plus its load accounting.
#[derive(Debug)]
pub struct ConnWrapper {
    id: u64,
    endpoint: Endpoint,
    channel: ArcSwap<Channel>,
    in_use: AtomicUsize,
    last_used: AtomicU64,
    state: AtomicU8,
}

impl ConnWrapper {
    fn new(id: u64, endpoint: Endpoint, channel: Channel, state: ConnState) -> Self {
        Self {
            id,
            endpoint,
            channel: ArcSwap::from_pointee(channel),
            in_use: AtomicUsize::new(0),
            last_used: AtomicU64::new(0),
            state: AtomicU8::new(state as u8),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// A handle to the current channel. Clones share the underlying
    /// HTTP/2 connection.
    pub fn channel(&self) -> Channel {
        Channel::clone(&self.channel.load())
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record that a call on this channel got through.
    pub fn mark_ready(&self) {
        if self.state() != ConnState::Shutdown {
            self.set_state(ConnState::Ready);
        }
    }

    /// Record a transport-level failure on this channel.
    pub fn mark_failed(&self) {
        if self.state() != ConnState::Shutdown {
            self.set_state(ConnState::TransientFailure);
        }
    }

    /// Swap in a lazily connecting channel so the next call reconnects
    /// immediately instead of waiting out the old channel's backoff.
    fn reset_backoff(&self) {
        debug!(conn_id = self.id, state = %self.state(), "Resetting connection backoff");
        self.channel.store(Arc::new(self.endpoint.connect_lazy()));
        self.set_state(ConnState::Connecting);
    }

    /// Mark the channel shut down. The connection closes once the last
    /// in-flight call drops its handle.
    fn close(&self) {
        self.set_state(ConnState::Shutdown);
        self.channel.store(Arc::new(self.endpoint.connect_lazy()));
    }
}

/// A checked-out connection. Releasing it (explicitly or on drop) returns it
/// to the pool, or closes it in dial-on-demand mode.
#[derive(Debug)]
pub struct ConnLease {
    conn: Arc<ConnWrapper>,
    ephemeral: bool,
    released: bool,
}

impl ConnLease {
    pub fn conn(&self) -> &ConnWrapper {
        &self.conn
    }

    pub fn channel(&self) -> Channel {
        self.conn.channel()
    }

    pub fn mark_ready(&self) {
        self.conn.mark_ready();
    }

    pub fn mark_failed(&self) {
        self.conn.mark_failed();
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.ephemeral {
            self.conn.close();
        } else {
            self.conn.in_use.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for ConnLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Pool of channels to the RPC server.
#[derive(Debug)]
pub struct ConnPool {
    size: usize,
    endpoint: Endpoint,
    conns: OnceLock<Vec<Arc<ConnWrapper>>>,
    destroyed: AtomicBool,
    next_id: AtomicU64,
    ticket: AtomicU64,
}

impl ConnPool {
    pub fn new(size: usize, endpoint: Endpoint) -> Self {
        Self {
            size,
            endpoint,
            conns: OnceLock::new(),
            destroyed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            ticket: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Open every long-lived connection. Any failure closes the connections
    /// opened so far and leaves the pool unusable.
    pub async fn init(&self) -> Result<()> {
        if self.size == 0 {
            info!("Connection pool in dial-on-demand mode");
            return Ok(());
        }
        if self.conns.get().is_some() {
            return Err(Error::Config("connection pool already initialized".to_string()));
        }

        let mut conns = Vec::with_capacity(self.size);
        for _ in 0..self.size {
            match self.endpoint.connect().await {
                Ok(channel) => conns.push(Arc::new(ConnWrapper::new(
                    self.next_id(),
                    self.endpoint.clone(),
                    channel,
                    ConnState::Ready,
                ))),
                Err(e) => {
                    warn!(
                        opened = conns.len(),
                        size = self.size,
                        error = %e,
                        "Connection pool init failed, tearing down"
                    );
                    for conn in &conns {
                        conn.close();
                    }
                    self.destroyed.store(true, Ordering::Release);
                    return Err(e.into());
                }
            }
        }

        self.install(conns);
        info!(size = self.size, uri = %self.endpoint.uri(), "Connection pool ready");
        Ok(())
    }

    fn install(&self, conns: Vec<Arc<ConnWrapper>>) {
        let _ = self.conns.set(conns);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Check out a connection. Never waits for a reconnect: degraded
    /// connections are returned after a backoff reset.
    pub async fn get_conn(&self) -> Result<ConnLease> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::PoolNotInitialized);
        }

        if self.size == 0 {
            let channel = self.endpoint.connect().await?;
            let conn = ConnWrapper::new(
                self.next_id(),
                self.endpoint.clone(),
                channel,
                ConnState::Ready,
            );
            debug!(conn_id = conn.id, "Dialed ephemeral connection");
            return Ok(ConnLease {
                conn: Arc::new(conn),
                ephemeral: true,
                released: false,
            });
        }

        let conns = self.conns.get().ok_or(Error::PoolNotInitialized)?;
        let conn = conns
            .iter()
            .min_by_key(|c| (c.in_use(), c.last_used()))
            .ok_or(Error::PoolNotInitialized)?;

        conn.in_use.fetch_add(1, Ordering::AcqRel);
        let ticket = self.ticket.fetch_add(1, Ordering::Relaxed) + 1;
        conn.last_used.store(ticket, Ordering::Release);

        if !conn.state().is_healthy() {
            conn.reset_backoff();
        }

        Ok(ConnLease {
            conn: Arc::clone(conn),
            ephemeral: false,
            released: false,
        })
    }

    /// Close every long-lived connection. Later checkouts fail.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(conns) = self.conns.get() {
            for conn in conns {
                conn.close();
            }
            info!(count = conns.len(), "Connection pool destroyed");
        }
    }

    /// Outstanding leases across all long-lived connections.
    pub fn in_use(&self) -> usize {
        self.conns
            .get()
            .map(|conns| conns.iter().map(|c| c.in_use()).sum())
            .unwrap_or(0)
    }

    /// Long-lived connections that have not been shut down.
    pub fn connection_count(&self) -> usize {
        self.conns
            .get()
            .map(|conns| {
                conns
                    .iter()
                    .filter(|c| c.state() != ConnState::Shutdown)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_pool(size: usize) -> ConnPool {
        let endpoint = build_endpoint("127.0.0.1:1", None).unwrap();
        let pool = ConnPool::new(size, endpoint.clone());
        let conns = (0..size)
            .map(|_| {
                Arc::new(ConnWrapper::new(
                    pool.next_id(),
                    endpoint.clone(),
                    endpoint.connect_lazy(),
                    ConnState::Ready,
                ))
            })
            .collect();
        pool.install(conns);
        pool
    }

    #[test]
    fn test_build_endpoint_scheme() {
        let endpoint = build_endpoint("127.0.0.1:7000", None).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));

        let endpoint = build_endpoint("http://10.0.0.1:7000", None).unwrap();
        assert_eq!(endpoint.uri().host(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_get_conn_before_init() {
        let pool = ConnPool::new(2, build_endpoint("127.0.0.1:1", None).unwrap());
        let err = pool.get_conn().await.unwrap_err();
        assert!(matches!(err, Error::PoolNotInitialized));
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_get_conn_picks_least_in_use() {
        let pool = lazy_pool(3);

        let a = pool.get_conn().await.unwrap();
        let b = pool.get_conn().await.unwrap();
        let c = pool.get_conn().await.unwrap();
        let mut ids = vec![a.conn().id(), b.conn().id(), c.conn().id()];
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3, "each connection should be used once");

        // Freeing `b` makes it the only connection with zero load.
        let freed = b.conn().id();
        b.release();
        let d = pool.get_conn().await.unwrap();
        assert_eq!(d.conn().id(), freed);
        assert_eq!(d.conn().in_use(), 1);

        drop((a, c, d));
        assert_eq!(pool.connection_count(), 3);
    }

    #[tokio::test]
    async fn test_ties_prefer_least_recently_used() {
        let pool = lazy_pool(2);

        let first = pool.get_conn().await.unwrap();
        let first_id = first.conn().id();
        drop(first);

        let second = pool.get_conn().await.unwrap();
        assert_ne!(second.conn().id(), first_id);
    }

    #[tokio::test]
    async fn test_release_is_exactly_once() {
        let pool = lazy_pool(1);
        let lease = pool.get_conn().await.unwrap();
        let conn = Arc::clone(&lease.conn);
        assert_eq!(conn.in_use(), 1);

        lease.release();
        assert_eq!(conn.in_use(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_is_reset_and_returned() {
        let pool = lazy_pool(1);
        let lease = pool.get_conn().await.unwrap();
        lease.mark_failed();
        assert_eq!(lease.conn().state(), ConnState::TransientFailure);
        drop(lease);

        let lease = pool.get_conn().await.unwrap();
        assert_eq!(lease.conn().state(), ConnState::Connecting);
    }

    #[tokio::test]
    async fn test_destroy_closes_everything() {
        let pool = lazy_pool(2);
        pool.destroy();
        assert_eq!(pool.connection_count(), 0);
        assert!(matches!(
            pool.get_conn().await.unwrap_err(),
            Error::PoolNotInitialized
        ));
    }

    #[tokio::test]
    async fn test_init_failure_is_all_or_nothing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = ConnPool::new(2, build_endpoint(&addr.to_string(), None).unwrap());
        assert!(pool.init().await.is_err());
        assert_eq!(pool.connection_count(), 0);
        assert!(matches!(
            pool.get_conn().await.unwrap_err(),
            Error::PoolNotInitialized
        ));
    }

    #[test]
    fn test_conn_state_health() {
        assert!(ConnState::Ready.is_healthy());
        assert!(ConnState::Connecting.is_healthy());
        assert!(!ConnState::Idle.is_healthy());
        assert!(!ConnState::TransientFailure.is_healthy());
        assert!(!ConnState::Shutdown.is_healthy());
    }
}
