use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use url::Url;

use super::{AddrPublisher, DEFAULT_CONNECT_TIMEOUT};
use crate::error::{Error, Result};

/// Longest CONNECT response head accepted from an HTTP upstream.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// An upstream proxy that `forward` routes dial through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Socks5 {
        addr: String,
        credentials: Option<(String, String)>,
    },
    Http {
        addr: String,
    },
}

impl Upstream {
    /// Parse `socks5://[user:pass@]host:port` or `http://host:port`.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| Error::Config(format!("forward url {raw:?}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("forward url {raw:?} has no host")))?;

        match url.scheme() {
            "socks5" | "socks5h" => {
                let port = url.port().unwrap_or(1080);
                let credentials = if url.username().is_empty() {
                    None
                } else {
                    Some((
                        url.username().to_string(),
                        url.password().unwrap_or_default().to_string(),
                    ))
                };
                Ok(Upstream::Socks5 {
                    addr: format!("{host}:{port}"),
                    credentials,
                })
            }
            "http" => Ok(Upstream::Http {
                addr: format!("{host}:{}", url.port().unwrap_or(8080)),
            }),
            other => Err(Error::Config(format!(
                "forward url {raw:?}: unsupported scheme {other:?}"
            ))),
        }
    }

    async fn connect(&self, target: &str) -> io::Result<TcpStream> {
        match self {
            Upstream::Socks5 { addr, credentials } => {
                let stream = match credentials {
                    Some((user, pass)) => {
                        Socks5Stream::connect_with_password(addr.as_str(), target, user, pass).await
                    }
                    None => Socks5Stream::connect(addr.as_str(), target).await,
                }
                .map_err(io::Error::other)?;
                Ok(stream.into_inner())
            }
            Upstream::Http { addr } => {
                let mut stream = TcpStream::connect(addr.as_str()).await?;
                let head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
                stream.write_all(head.as_bytes()).await?;
                read_connect_response(&mut stream).await?;
                Ok(stream)
            }
        }
    }
}

/// Read an HTTP CONNECT response head byte by byte so nothing past the
/// blank line is consumed.
async fn read_connect_response(stream: &mut TcpStream) -> io::Result<()> {
    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upstream CONNECT response too large",
            ));
        }
        head.push(stream.read_u8().await?);
    }

    let status_line = head.split(|b| *b == b'\n').next().unwrap_or_default();
    let status = String::from_utf8_lossy(status_line);
    let code = status.split_whitespace().nth(1).unwrap_or_default();
    if code.starts_with('2') {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("upstream refused CONNECT: {}", status.trim_end()),
        ))
    }
}

/// Egress that dials through a configured upstream proxy.
#[derive(Debug, Clone)]
pub struct Forward {
    upstream: Option<Arc<Upstream>>,
    connect_timeout: Duration,
}

impl Forward {
    pub fn new(upstream: Option<Upstream>) -> Self {
        Self {
            upstream: upstream.map(Arc::new),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub async fn dial(&self, addr: &str) -> Result<TcpStream> {
        let upstream = self
            .upstream
            .as_ref()
            .ok_or_else(|| Error::NotImplemented("forward without an upstream".to_string()))?;

        match timeout(self.connect_timeout, upstream.connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(Error::Dial {
                addr: addr.to_string(),
                source,
            }),
            Err(_) => Err(Error::DialTimeout(addr.to_string())),
        }
    }

    /// Full sessions are not relayed through forward egress; only `dial` is.
    pub(super) async fn proxy(&self, mut publisher: AddrPublisher) -> Result<()> {
        publisher.fail();
        Err(Error::NotImplemented("forward proxy".to_string()))
    }
}
