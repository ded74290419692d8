//! TLS material for the tunnel channel.

use std::path::Path;

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::{ClientTls, ServerTls};
use crate::error::{Error, Result};

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Config(format!("read {}: {e}", path.display())))
}

/// Host part of `host:port` or `scheme://host:port`, without IPv6 brackets.
fn host_of(server_addr: &str) -> &str {
    let rest = server_addr
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(server_addr);
    let authority = rest.split('/').next().unwrap_or(rest);

    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
}

/// Client TLS config, or `None` when TLS is disabled. Configured CA bundles
/// replace the system roots.
pub fn client_tls(settings: &ClientTls, server_addr: &str) -> Result<Option<ClientTlsConfig>> {
    if !settings.enabled {
        return Ok(None);
    }

    let domain = settings
        .server_name
        .clone()
        .unwrap_or_else(|| host_of(server_addr).to_string());
    let mut config = ClientTlsConfig::new().domain_name(domain);

    if settings.ca_paths.is_empty() {
        config = config.with_enabled_roots();
    } else {
        for path in &settings.ca_paths {
            config = config.ca_certificate(Certificate::from_pem(read_pem(path)?));
        }
    }
    Ok(Some(config))
}

/// Server TLS config, or `None` when TLS is disabled.
pub fn server_tls(settings: &ServerTls) -> Result<Option<ServerTlsConfig>> {
    if !settings.enabled {
        return Ok(None);
    }

    let (cert_path, key_path) = match (&settings.cert_path, &settings.key_path) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(Error::Config(
                "tls.cert_path and tls.key_path are required when tls is enabled".to_string(),
            ))
        }
    };
    let identity = Identity::from_pem(read_pem(cert_path)?, read_pem(key_path)?);
    Ok(Some(ServerTlsConfig::new().identity(identity)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("tunnel.example.com:8443"), "tunnel.example.com");
        assert_eq!(host_of("https://tunnel.example.com:8443/"), "tunnel.example.com");
        assert_eq!(host_of("[::1]:8443"), "::1");
        assert_eq!(host_of("tunnel.example.com"), "tunnel.example.com");
    }

    #[test]
    fn test_disabled_tls() {
        assert!(client_tls(&ClientTls::default(), "h:1").unwrap().is_none());
        assert!(server_tls(&ServerTls::default()).unwrap().is_none());
    }

    #[test]
    fn test_missing_material() {
        let client = ClientTls {
            enabled: true,
            ca_paths: vec![PathBuf::from("/nonexistent/ca.pem")],
            server_name: None,
        };
        assert!(matches!(client_tls(&client, "h:1"), Err(Error::Config(_))));

        let server = ServerTls {
            enabled: true,
            cert_path: Some(PathBuf::from("/nonexistent/cert.pem")),
            key_path: None,
        };
        assert!(matches!(server_tls(&server), Err(Error::Config(_))));
    }
}
