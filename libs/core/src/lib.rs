//! burrow tunnel engine.
//!
//! Transports, the route engine, the RPC channel pool and both sides of the
//! streaming tunnel protocol. The client and server binaries wire these
//! together; every piece of shared state (stats, buffers, routes, pool) is
//! created once at startup and injected.

pub mod config;
pub mod error;
pub mod pool;
pub mod route;
pub mod server;
pub mod stats;
pub mod tls;
pub mod transport;

pub use error::{Error, Result};
pub use pool::{build_endpoint, ConnLease, ConnPool, ConnState};
pub use route::{Egress, EgressFactory, MatchType, Route, RouteEngine};
pub use server::TunnelService;
pub use stats::{BufferPool, Stats, StatsSnapshot};
pub use transport::{addr_channel, AddrPublisher, AddrReceiver, Network, Request, Transport};
