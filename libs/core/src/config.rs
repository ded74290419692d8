//! Client and server configuration files.
//!
//! Both sides read a JSON document once at startup. Routes are turned into
//! [`Route`]s here; the route engine compiles them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::route::{Egress, MatchType, Route};
use crate::stats::DEFAULT_BUFFER_KB;
use crate::transport::{Network, Upstream};

/// Default pool size on the client.
pub const DEFAULT_MUX: usize = 4;

fn default_buffer_kb() -> usize {
    DEFAULT_BUFFER_KB
}

fn default_mux() -> usize {
    DEFAULT_MUX
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

/// Read and validate a JSON config file.
pub fn load<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    let config: T = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Checks run once after parsing.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// One routing rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub ext_path: Option<PathBuf>,
    pub destination: Egress,
    #[serde(default)]
    pub match_type: MatchType,
}

impl RouteConfig {
    pub fn to_route(&self) -> Route {
        Route::new(
            self.sources.clone(),
            self.ext_path.clone(),
            self.destination,
            self.match_type,
        )
    }
}

fn to_routes(routes: &[RouteConfig]) -> Vec<Route> {
    routes.iter().map(RouteConfig::to_route).collect()
}

fn parse_forward(forward_url: &Option<String>) -> Result<Option<Upstream>> {
    forward_url.as_deref().map(Upstream::parse).transpose()
}

/// TLS settings for the client's connection to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTls {
    pub enabled: bool,
    /// Extra PEM CA bundles. The system roots are used when empty.
    pub ca_paths: Vec<PathBuf>,
    /// Name checked against the server certificate. Defaults to the host
    /// part of `server_addr`.
    pub server_name: Option<String>,
}

/// TLS settings for the server's listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerTls {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// SOCKS5 listen address.
    #[serde(default)]
    pub socks_addr: Option<String>,
    /// HTTP proxy listen address.
    #[serde(default)]
    pub http_addr: Option<String>,
    /// Tunnel server, `host:port` or a full URI.
    pub server_addr: String,
    /// Pooled channels to the server; 0 dials one per connection.
    #[serde(default = "default_mux")]
    pub mux: usize,
    #[serde(default)]
    pub tls: ClientTls,
    pub user_id: String,
    #[serde(default = "default_buffer_kb")]
    pub buffer_kb: usize,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub forward_url: Option<String>,
    /// Reserved.
    #[serde(default)]
    pub bandwidth_kbps: Option<u64>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ClientConfig {
    pub fn routes(&self) -> Vec<Route> {
        to_routes(&self.routes)
    }

    pub fn network(&self) -> Network {
        Network::from_ipv6(self.ipv6)
    }

    pub fn forward_upstream(&self) -> Result<Option<Upstream>> {
        parse_forward(&self.forward_url)
    }
}

impl Validate for ClientConfig {
    fn validate(&self) -> Result<()> {
        if self.socks_addr.is_none() && self.http_addr.is_none() {
            return Err(Error::Config(
                "at least one of socks_addr or http_addr is required".to_string(),
            ));
        }
        if self.server_addr.trim().is_empty() {
            return Err(Error::Config("server_addr is required".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::Config("user_id is required".to_string()));
        }
        if self.buffer_kb == 0 {
            return Err(Error::Config("buffer_kb must be positive".to_string()));
        }
        self.forward_upstream()?;
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub tls: ServerTls,
    /// User ids allowed to open tunnels.
    pub users: Vec<String>,
    #[serde(default = "default_buffer_kb")]
    pub buffer_kb: usize,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub forward_url: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn routes(&self) -> Vec<Route> {
        to_routes(&self.routes)
    }

    pub fn network(&self) -> Network {
        Network::from_ipv6(self.ipv6)
    }

    pub fn forward_upstream(&self) -> Result<Option<Upstream>> {
        parse_forward(&self.forward_url)
    }

    pub fn user_set(&self) -> HashSet<String> {
        self.users.iter().cloned().collect()
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            return Err(Error::Config("users must not be empty".to_string()));
        }
        if self.buffer_kb == 0 {
            return Err(Error::Config("buffer_kb must be positive".to_string()));
        }
        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            return Err(Error::Config(
                "tls.cert_path and tls.key_path are required when tls is enabled".to_string(),
            ));
        }
        self.forward_upstream()?;
        Ok(())
    }
}
