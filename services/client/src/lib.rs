//! burrow client.
//!
//! Local SOCKS5 and HTTP proxy front-ends. Each accepted connection is
//! routed through the shared [`burrow_core::RouteEngine`] and relayed over
//! the chosen transport, usually a tunnel stream to the burrow server.

pub mod inbound;
pub mod session;

pub use inbound::{Inbound, ListenerConfig, ListenerStats, Protocol};
pub use session::{relay, relay_capped, Outcome, Reply};
