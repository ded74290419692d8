//! HTTP proxy front-end.
//!
//! - `CONNECT host:port` opens a raw tunnel after `200 Connection Established`
//! - Absolute-form requests (`GET http://host/path`) are forwarded once, with
//!   the request line rewritten to origin-form and hop-by-hop proxy headers
//!   dropped; the connection closes after the response
//! - Sessions are capped at [`HTTP_SESSION_CAP`]

use std::io;
use std::time::Duration;

use burrow_core::Request;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use crate::session::Reply;

/// Hard limit on one proxied HTTP session.
pub const HTTP_SESSION_CAP: Duration = Duration::from_secs(30 * 60);

/// Largest request head accepted.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

pub const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const RESPONSE_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub const RESPONSE_FORBIDDEN: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub const RESPONSE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Headers that only concern the proxy hop.
const HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization", "connection", "keep-alive"];

/// A parsed proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRequest {
    /// `CONNECT`: tunnel raw bytes.
    Connect(Request),
    /// Absolute-form request; `head` is the rewritten request head.
    Forward { request: Request, head: Vec<u8> },
}

impl ProxyRequest {
    pub fn target(&self) -> &Request {
        match self {
            ProxyRequest::Connect(request) => request,
            ProxyRequest::Forward { request, .. } => request,
        }
    }
}

/// Replies for CONNECT tunnels.
pub struct ConnectReply;

impl Reply for ConnectReply {
    fn established(&self, _bound: &str) -> Vec<u8> {
        RESPONSE_ESTABLISHED.to_vec()
    }

    fn failed(&self) -> Vec<u8> {
        RESPONSE_UNAVAILABLE.to_vec()
    }
}

/// Replies for forwarded requests: the origin's response is the reply.
pub struct ForwardReply;

impl Reply for ForwardReply {
    fn established(&self, _bound: &str) -> Vec<u8> {
        Vec::new()
    }

    fn failed(&self) -> Vec<u8> {
        RESPONSE_UNAVAILABLE.to_vec()
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read the request head. Returns the head (terminator included) and any
/// bytes read past it.
pub async fn read_head<R>(reader: &mut R) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        // Only the new bytes and a 3-byte overlap need scanning.
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf[scan_from..]) {
            let rest = buf.split_off(scan_from + end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(invalid("request head too large"));
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals.
fn parse_authority(authority: &str, default_port: u16) -> io::Result<Request> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid(format!("bad authority {authority:?}")))?;
        (host, tail.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port {
        Some(port) => port
            .parse()
            .map_err(|_| invalid(format!("bad port in {authority:?}")))?,
        None => default_port,
    };
    if host.is_empty() {
        return Err(invalid(format!("missing host in {authority:?}")));
    }
    Ok(Request::new(host, port))
}

/// Parse a request head (as returned by [`read_head`]) into a proxy request.
pub fn parse_request(head: &[u8]) -> io::Result<ProxyRequest> {
    let text = std::str::from_utf8(head).map_err(|_| invalid("request head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => (method, target, version),
        _ => return Err(invalid(format!("bad request line {request_line:?}"))),
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(ProxyRequest::Connect(parse_authority(target, 443)?));
    }

    let url = Url::parse(target).map_err(|_| invalid(format!("not an absolute URI: {target:?}")))?;
    if url.scheme() != "http" {
        return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
    }
    let host = url
        .host_str()
        .ok_or_else(|| invalid(format!("missing host in {target:?}")))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let request = Request::new(host, port);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut rewritten = format!("{method} {path} {version}\r\n");
    for line in lines.filter(|line| !line.is_empty()) {
        let name = line.split(':').next().unwrap_or_default().trim();
        if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        rewritten.push_str(line);
        rewritten.push_str("\r\n");
    }
    rewritten.push_str("Connection: close\r\n\r\n");

    Ok(ProxyRequest::Forward {
        request,
        head: rewritten.into_bytes(),
    })
}
