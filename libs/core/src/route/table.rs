use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use super::{Egress, EgressFactory, Route};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Ordered routes plus the destination decision memo.
///
/// Routes are immutable once the engine is built. The memo only ever gains
/// entries, so a destination resolves to the same egress for the lifetime of
/// the process.
#[derive(Debug)]
pub struct RouteEngine {
    routes: Vec<Route>,
    memo: RwLock<HashMap<String, Egress>>,
    factory: EgressFactory,
}

impl RouteEngine {
    /// Build the engine, generating every route's match cache. An empty
    /// route list falls back to `default_route`.
    pub fn new(mut routes: Vec<Route>, default_route: Route, factory: EgressFactory) -> Result<Self> {
        if routes.is_empty() {
            routes.push(default_route);
        }
        for route in &mut routes {
            route.generate_cache()?;
        }
        Ok(Self {
            routes,
            memo: RwLock::new(HashMap::new()),
            factory,
        })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn factory(&self) -> &EgressFactory {
        &self.factory
    }

    /// The egress for `dst`: memo first, then the first matching route.
    pub fn resolve(&self, dst: &str) -> Result<Egress> {
        if let Some(egress) = self.memo.read().ok().and_then(|memo| memo.get(dst).copied()) {
            return Ok(egress);
        }

        let egress = self
            .routes
            .iter()
            .find(|route| route.matches(dst))
            .map(|route| route.destination)
            .ok_or_else(|| Error::RouteNotFound(dst.to_string()))?;

        if let Ok(mut memo) = self.memo.write() {
            // A concurrent resolver may have won; keep its entry.
            let egress = *memo.entry(dst.to_string()).or_insert(egress);
            debug!(dst = %dst, egress = %egress, "Route resolved");
            return Ok(egress);
        }
        Ok(egress)
    }

    /// Resolve `dst` and build a transport for it. Block routes fail with
    /// [`Error::Unimplemented`].
    pub async fn get_route(&self, dst: &str) -> Result<Transport> {
        let egress = self.resolve(dst)?;
        self.factory.transport(egress).await
    }

    pub fn memo_len(&self) -> usize {
        self.memo.read().map(|memo| memo.len()).unwrap_or(0)
    }
}
