//! Wire types for the burrow tunnel protocol.
//!
//! A proxy session is one bidirectional `Proxy` stream. The client sends a
//! single header frame followed by payload frames; the server answers with
//! status-tagged frames (`Accepted` header, `Session` payloads, then `Eof` or
//! `Error`).

pub mod tunnel {
    pub mod v1 {
        mod frames;

        pub use frames::*;

        include!(concat!(env!("OUT_DIR"), "/burrow.tunnel.v1.Tunnel.rs"));

        pub use tunnel_client::TunnelClient;
        pub use tunnel_server::{Tunnel, TunnelServer};
    }
}
