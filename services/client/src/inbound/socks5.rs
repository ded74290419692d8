//! SOCKS5 front-end (RFC 1928), no authentication, CONNECT only.
//!
//! ```text
//! client: VER NMETHODS METHODS       server: VER 0x00
//! client: VER CMD RSV ATYP ADDR PORT server: VER REP RSV ATYP BND.ADDR BND.PORT
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use burrow_core::Request;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::session::Reply;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_UNACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes used by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Encode a reply carrying `bound` (0.0.0.0:0 when absent).
pub fn encode_reply(code: ReplyCode, bound: Option<SocketAddr>) -> Vec<u8> {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut buf = Vec::with_capacity(22);
    buf.push(SOCKS5_VERSION);
    buf.push(code as u8);
    buf.push(0x00);

    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&bound.port().to_be_bytes());
    buf
}

/// Replies for an accepted CONNECT.
pub struct ConnectReply;

impl Reply for ConnectReply {
    fn established(&self, bound: &str) -> Vec<u8> {
        encode_reply(ReplyCode::Succeeded, bound.parse().ok())
    }

    fn failed(&self) -> Vec<u8> {
        encode_reply(ReplyCode::NetworkUnreachable, None)
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Negotiate the method and read the CONNECT request. Unsupported requests
/// are answered here and reported as errors.
pub async fn handshake<S>(stream: &mut S) -> io::Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 256];

    stream.read_exact(&mut buf[..2]).await?;
    let (version, nmethods) = (buf[0], buf[1] as usize);
    if version != SOCKS5_VERSION {
        return Err(invalid(format!("invalid SOCKS version: {version}")));
    }
    if nmethods == 0 {
        return Err(invalid("no auth methods offered".to_string()));
    }
    stream.read_exact(&mut buf[..nmethods]).await?;

    if !buf[..nmethods].contains(&AUTH_METHOD_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_METHOD_UNACCEPTABLE])
            .await?;
        return Err(invalid("no acceptable auth method".to_string()));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await?;

    stream.read_exact(&mut buf[..4]).await?;
    let (version, cmd, atyp) = (buf[0], buf[1], buf[3]);
    if version != SOCKS5_VERSION {
        return Err(invalid(format!("invalid SOCKS version in request: {version}")));
    }
    if cmd != CMD_CONNECT {
        stream
            .write_all(&encode_reply(ReplyCode::CommandNotSupported, None))
            .await?;
        return Err(invalid(format!("unsupported command: {cmd:#04x}")));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            stream.read_exact(&mut buf[..4]).await?;
            Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]).to_string()
        }
        ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            if len == 0 {
                stream
                    .write_all(&encode_reply(ReplyCode::AddressTypeNotSupported, None))
                    .await?;
                return Err(invalid("empty domain".to_string()));
            }
            stream.read_exact(&mut buf[..len]).await?;
            String::from_utf8_lossy(&buf[..len]).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            stream
                .write_all(&encode_reply(ReplyCode::AddressTypeNotSupported, None))
                .await?;
            return Err(invalid(format!("unsupported address type: {other:#04x}")));
        }
    };

    stream.read_exact(&mut buf[..2]).await?;
    let port = u16::from_be_bytes([buf[0], buf[1]]);

    let request = Request::new(host, port);
    trace!(target = %request, "SOCKS5 CONNECT request parsed");
    Ok(request)
}
