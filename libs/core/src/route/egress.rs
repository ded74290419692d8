use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::pool::ConnPool;
use crate::stats::{BufferPool, Stats};
use crate::transport::{Blackhole, Direct, Forward, Network, RpcClient, Transport, Upstream};

/// The handling chosen for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Egress {
    Direct,
    /// Tunnel over the RPC connection pool.
    Proxy,
    Forward,
    /// Refuse the connection.
    Block,
    Blackhole,
}

impl FromStr for Egress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Egress::Direct),
            "proxy" => Ok(Egress::Proxy),
            "forward" => Ok(Egress::Forward),
            "block" => Ok(Egress::Block),
            "blackhole" => Ok(Egress::Blackhole),
            _ => Err(Error::NotImplemented(format!("egress {s:?}"))),
        }
    }
}

impl<'de> Deserialize<'de> for Egress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Egress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Egress::Direct => "direct",
            Egress::Proxy => "proxy",
            Egress::Forward => "forward",
            Egress::Block => "block",
            Egress::Blackhole => "blackhole",
        };
        f.write_str(name)
    }
}

/// Tunnel settings for the `proxy` egress.
#[derive(Debug, Clone)]
pub struct RpcEgress {
    pub pool: Arc<ConnPool>,
    pub user_id: String,
}

/// Builds a [`Transport`] for an [`Egress`], carrying the shared state every
/// transport needs.
#[derive(Debug, Clone)]
pub struct EgressFactory {
    stats: Arc<Stats>,
    buffers: Arc<BufferPool>,
    direct: Direct,
    blackhole: Blackhole,
    forward: Forward,
    rpc: Option<RpcEgress>,
}

impl EgressFactory {
    pub fn new(stats: Arc<Stats>, buffers: Arc<BufferPool>, network: Network) -> Self {
        Self {
            direct: Direct::new(Arc::clone(&stats), Arc::clone(&buffers), network),
            blackhole: Blackhole::new(Arc::clone(&stats), Arc::clone(&buffers)),
            forward: Forward::new(None),
            rpc: None,
            stats,
            buffers,
        }
    }

    pub fn with_forward(mut self, upstream: Option<Upstream>) -> Self {
        self.forward = Forward::new(upstream);
        self
    }

    pub fn with_rpc(mut self, pool: Arc<ConnPool>, user_id: impl Into<String>) -> Self {
        self.rpc = Some(RpcEgress {
            pool,
            user_id: user_id.into(),
        });
        self
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// A transport for one connection. Process-wide transports are cloned;
    /// `proxy` checks a connection out of the pool.
    pub async fn transport(&self, egress: Egress) -> Result<Transport> {
        match egress {
            Egress::Direct => Ok(Transport::Direct(self.direct.clone())),
            Egress::Blackhole => Ok(Transport::Blackhole(self.blackhole.clone())),
            Egress::Forward => Ok(Transport::Forward(self.forward.clone())),
            Egress::Block => Err(Error::Unimplemented),
            Egress::Proxy => {
                let rpc = self.rpc.as_ref().ok_or_else(|| {
                    Error::NotImplemented("proxy egress without a connection pool".to_string())
                })?;
                let lease = rpc.pool.get_conn().await?;
                Ok(Transport::Rpc(RpcClient::new(
                    lease,
                    rpc.user_id.clone(),
                    Arc::clone(&self.stats),
                    Arc::clone(&self.buffers),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_egress_names() {
        assert_eq!("Direct".parse::<Egress>().unwrap(), Egress::Direct);
        assert_eq!("blackhole".parse::<Egress>().unwrap(), Egress::Blackhole);
        match "teleport".parse::<Egress>() {
            Err(Error::NotImplemented(what)) => assert!(what.contains("teleport")),
            other => panic!("Expected NotImplemented, got {:?}", other),
        }
    }

    #[test]
    fn test_egress_deserialize() {
        let egress: Egress = serde_json::from_str("\"forward\"").unwrap();
        assert_eq!(egress, Egress::Forward);
        assert!(serde_json::from_str::<Egress>("\"teleport\"").is_err());
    }

    #[tokio::test]
    async fn test_block_is_unimplemented() {
        let factory = EgressFactory::new(Stats::new(), BufferPool::new(1), Network::Tcp);
        assert!(matches!(
            factory.transport(Egress::Block).await,
            Err(Error::Unimplemented)
        ));
    }

    #[tokio::test]
    async fn test_proxy_without_pool() {
        let factory = EgressFactory::new(Stats::new(), BufferPool::new(1), Network::Tcp);
        assert!(matches!(
            factory.transport(Egress::Proxy).await,
            Err(Error::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn test_process_wide_transports() {
        let factory = EgressFactory::new(Stats::new(), BufferPool::new(1), Network::Tcp4);
        assert_eq!(factory.transport(Egress::Direct).await.unwrap().name(), "direct");
        assert_eq!(factory.transport(Egress::Blackhole).await.unwrap().name(), "blackhole");
        assert_eq!(factory.transport(Egress::Forward).await.unwrap().name(), "forward");
    }
}
