#![allow(dead_code)]

use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};

use tollgate::blacklist::Blacklist;
use tollgate::cache::HttpCache;
use tollgate::handler::RequestHandler;

/// Raw TCP origin (or next-hop proxy) double: counts connections, captures
/// request heads, answers with one canned response per connection.
pub struct MockOrigin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockOrigin {
    pub async fn start(response: &str) -> Self {
        Self::start_with_delay(response, Duration::ZERO).await
    }

    pub async fn start_with_delay(response: &str, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock origin");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, mut rx) = oneshot::channel();
        let response = response.to_string();

        let hits_counter = Arc::clone(&hits);
        let captured = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (mut stream, _) = match res { Ok(v) => v, Err(_) => break };
                        hits_counter.fetch_add(1, Ordering::SeqCst);
                        let captured = Arc::clone(&captured);
                        let response = response.clone();
                        tokio::spawn(async move {
                            let head = read_head(&mut stream).await;
                            captured.lock().await.push(head);
                            if delay > Duration::ZERO {
                                tokio::time::sleep(delay).await;
                            }
                            let _ = stream.write_all(response.as_bytes()).await;
                            let _ = stream.flush().await;
                            let _ = stream.shutdown().await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            requests,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL routing through this mock.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn cacheable_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

pub fn uncacheable_response(body: &str) -> String {
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len())
}

pub fn test_handler() -> (Arc<RequestHandler>, Arc<HttpCache>) {
    let cache = Arc::new(HttpCache::new());
    let handler = Arc::new(RequestHandler::new(
        Arc::clone(&cache),
        Arc::new(Blacklist::default()),
        None,
    ));
    (handler, cache)
}

pub fn handler_with_blacklist(patterns: &str) -> Arc<RequestHandler> {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(patterns.as_bytes()).expect("write blacklist");
    let blacklist = Blacklist::load(file.path()).expect("load blacklist");
    Arc::new(RequestHandler::new(
        Arc::new(HttpCache::new()),
        Arc::new(blacklist),
        None,
    ))
}

/// Connected socket pair plus the peer address the accepting side sees.
pub async fn tcp_pair() -> (TcpStream, TcpStream, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind pair");
    let addr = listener.local_addr().expect("local addr");
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client = client.expect("connect pair");
    let (server, peer) = accepted.expect("accept pair");
    (client, server, peer.ip().to_string())
}

/// Runs one terminal-mode exchange against the handler and returns the raw
/// bytes the client saw (empty when the proxy closed silently).
pub async fn exchange_terminal(handler: &Arc<RequestHandler>, raw_request: &str) -> Vec<u8> {
    let (client, server, peer_ip) = tcp_pair().await;
    let handler = Arc::clone(handler);
    let service = tokio::spawn(async move { handler.service_request(server, peer_ip).await });
    let bytes = drive_client(client, raw_request).await;
    service.await.expect("service task");
    bytes
}

pub async fn exchange_chained(
    handler: &Arc<RequestHandler>,
    raw_request: &str,
    proxy_addr: SocketAddr,
) -> Vec<u8> {
    let (client, server, peer_ip) = tcp_pair().await;
    let handler = Arc::clone(handler);
    let service = tokio::spawn(async move {
        handler
            .service_chained(server, peer_ip, &proxy_addr.ip().to_string(), proxy_addr.port())
            .await
    });
    let bytes = drive_client(client, raw_request).await;
    service.await.expect("service task");
    bytes
}

async fn drive_client(mut client: TcpStream, raw_request: &str) -> Vec<u8> {
    client
        .write_all(raw_request.as_bytes())
        .await
        .expect("write request");
    client.flush().await.expect("flush request");
    let mut bytes = Vec::new();
    client.read_to_end(&mut bytes).await.expect("read response");
    bytes
}

pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

/// Minimal split of a raw HTTP response; None when the proxy sent nothing.
pub fn parse_response(bytes: &[u8]) -> Option<RawResponse> {
    if bytes.is_empty() {
        return None;
    }
    let split = bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete response head");
    let head = String::from_utf8_lossy(&bytes[..split]).into_owned();
    let body = bytes[split + 4..].to_vec();
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status code");
    Some(RawResponse { status, head, body })
}

pub fn get_request(url: &str) -> String {
    format!("GET {url} HTTP/1.1\r\nHost: placeholder\r\n\r\n")
}

pub fn head_request(url: &str) -> String {
    format!("HEAD {url} HTTP/1.1\r\nHost: placeholder\r\n\r\n")
}
