//! Per-destination egress selection.
//!
//! ```text
//! dst ──► memo hit? ──yes──► Egress ──► EgressFactory::transport ──► Transport
//!            │no
//!            └──► first matching Route (exact | domain | regex | cidr | default)
//!                      └──► memo insert
//! ```

mod egress;
mod matcher;
mod table;

pub use egress::{Egress, EgressFactory, RpcEgress};
pub use matcher::{
    normalize_hostname, registrable_domain, MatchCache, MatchType, Route, PUBLIC_SUFFIX_LIST_ENV,
};
pub use table::RouteEngine;
