//! SOCKS5 and HTTP listeners end to end, with direct egress to local
//! backends.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use burrow_client::inbound::{http, socks5};
use burrow_client::{Inbound, ListenerConfig, Protocol};
use burrow_core::{BufferPool, Egress, EgressFactory, MatchType, Network, Route, RouteEngine, Stats};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Proxy {
    addr: SocketAddr,
    inbound: Arc<Inbound>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
}

impl Proxy {
    async fn spawn(protocol: Protocol) -> Self {
        let stats = Stats::new();
        let factory = EgressFactory::new(Arc::clone(&stats), BufferPool::new(4), Network::Tcp);
        let blocked = Route::new(
            vec!["blocked.test".to_string()],
            None,
            Egress::Block,
            MatchType::Exact,
        );
        let routes = RouteEngine::new(
            vec![blocked, Route::server_default()],
            Route::server_default(),
            factory,
        )
        .unwrap();

        let shutdown = CancellationToken::new();
        let config = ListenerConfig::new("127.0.0.1:0".parse().unwrap(), protocol, 4096);
        let inbound = Arc::new(
            Inbound::bind(config, Arc::new(routes), shutdown.clone())
                .await
                .unwrap(),
        );
        let addr = inbound.local_addr().unwrap();
        tokio::spawn(Arc::clone(&inbound).run());

        Self {
            addr,
            inbound,
            stats,
            shutdown,
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Answers one HTTP request and reports the head it received.
async fn spawn_origin() -> (SocketAddr, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (head, _) = http::read_head(&mut stream).await.unwrap();
        tx.send(String::from_utf8(head).unwrap()).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });
    (addr, rx)
}

async fn socks_connect(proxy: SocketAddr, atyp_and_addr: &[u8], port: u16) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, socks5::CMD_CONNECT, 0x00];
    request.extend_from_slice(atyp_and_addr);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = vec![0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply)
}

#[tokio::test]
async fn test_socks5_connect_relays_bytes() {
    let echo = spawn_echo().await;
    let proxy = Proxy::spawn(Protocol::Socks5).await;

    let (mut stream, reply) =
        socks_connect(proxy.addr, &[socks5::ATYP_IPV4, 127, 0, 0, 1], echo.port()).await;
    assert_eq!(reply[1], socks5::ReplyCode::Succeeded as u8);
    assert_eq!(reply[3], socks5::ATYP_IPV4);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

    stream.write_all(b"ping through socks").await.unwrap();
    let mut echoed = vec![0u8; 18];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"ping through socks");

    drop(stream);
    let stats = Arc::clone(&proxy.stats);
    tokio::time::timeout(TIMEOUT, async {
        let listener = proxy.inbound.stats();
        while stats.rx() < 18 || listener.connections_closed.load(Ordering::Relaxed) < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(stats.tx(), 18);
}

#[tokio::test]
async fn test_socks5_blocked_destination() {
    let proxy = Proxy::spawn(Protocol::Socks5).await;

    let mut addr = vec![socks5::ATYP_DOMAIN, 12];
    addr.extend_from_slice(b"blocked.test");
    let (_stream, reply) = socks_connect(proxy.addr, &addr, 443).await;

    assert_eq!(reply[1], socks5::ReplyCode::NotAllowed as u8);
    assert_eq!(proxy.inbound.stats().routes_blocked.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_http_connect_relays_bytes() {
    let echo = spawn_echo().await;
    let proxy = Proxy::spawn(Protocol::Http).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    // Early bytes after the head must reach the target too.
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\nearly");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; http::RESPONSE_ESTABLISHED.len()];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, http::RESPONSE_ESTABLISHED);

    stream.write_all(b" and late").await.unwrap();
    let mut echoed = vec![0u8; 14];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"early and late");
}

#[tokio::test]
async fn test_http_forward_rewrites_request() {
    let (origin, mut heads) = spawn_origin().await;
    let proxy = Proxy::spawn(Protocol::Http).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://{origin}/status?full=1 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

    let head = heads.recv().await.unwrap();
    assert_eq!(
        head,
        format!("GET /status?full=1 HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n")
    );
}

#[tokio::test]
async fn test_http_blocked_and_malformed() {
    let proxy = Proxy::spawn(Protocol::Http).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"CONNECT blocked.test:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, http::RESPONSE_FORBIDDEN);

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(b"GET /relative HTTP/1.1\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, http::RESPONSE_BAD_REQUEST);
}
