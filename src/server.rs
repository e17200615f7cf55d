//! TCP front door for the relay.
//!
//! Every accepted connection is peeked: a WebSocket upgrade on the configured
//! path goes to [`relay::handle_ws`], anything else gets a small HTTP answer.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use colored::*;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::relay::{self, HubStore};

const PEEK_LIMIT: usize = 4096;
/// How long a client may take to deliver its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);
const PEEK_BACKOFF: Duration = Duration::from_millis(10);

/// Percent-decoding for query values. `+` is a space.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Query string into key/value pairs; later duplicates win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

/// Split `/path?query` into its parts.
pub fn split_target(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(idx) => (&target[..idx], &target[idx + 1..]),
        None => (target, ""),
    }
}

/// The parsed head of an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub upgrade_websocket: bool,
}

/// Parse a request head with `httparse`. `None` while the head is incomplete
/// or not HTTP.
pub fn parse_head(buf: &[u8]) -> Option<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }
    let upgrade_websocket = req.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("upgrade")
            && std::str::from_utf8(h.value)
                .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    });
    Some(RequestHead {
        method: req.method?.to_string(),
        target: req.path?.to_string(),
        upgrade_websocket,
    })
}

/// Bind the configured address.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    Ok(TcpListener::bind(config.bind_address()).await?)
}

/// Bind and serve until Ctrl+C.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let listener = bind(&config).await?;
    let addr = listener.local_addr()?;
    eprintln!(
        "{}",
        format!("  Relay listening on ws://{}{}", addr, config.ws_path).bright_green()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());

    let hub = relay::new_hub(config.broadcast_capacity);
    run(listener, config, hub, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Accept connections on `listener` until `shutdown` resolves.
pub async fn run(
    listener: TcpListener,
    config: ServerConfig,
    hub: HubStore,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let ticker = config
        .roster_interval()
        .map(|every| relay::spawn_roster_ticker(hub.clone(), every));
    info!(
        addr = %listener.local_addr()?,
        ws_path = %config.ws_path,
        roster_interval_secs = config.roster_interval_secs,
        "relay started"
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("relay shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let hub = hub.clone();
                let ws_path = config.ws_path.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, hub, &ws_path).await {
                        debug!(%peer, error = %e, "connection error");
                    }
                });
            }
        }
    }

    if let Some(ticker) = ticker {
        ticker.abort();
    }
    Ok(())
}

/// Peek until a full request head is buffered, without consuming it.
///
/// `None` when the peer closes, the head outgrows [`PEEK_LIMIT`], or `limit`
/// elapses first.
async fn peek_head(stream: &TcpStream, limit: Duration) -> Result<Option<RequestHead>> {
    match tokio::time::timeout(limit, peek_until_complete(stream)).await {
        Ok(head) => head,
        Err(_) => {
            debug!(timeout_ms = limit.as_millis() as u64, "request head incomplete");
            Ok(None)
        }
    }
}

async fn peek_until_complete(stream: &TcpStream) -> Result<Option<RequestHead>> {
    let mut buf = vec![0u8; PEEK_LIMIT];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if n > seen {
            if let Some(head) = parse_head(&buf[..n]) {
                return Ok(Some(head));
            }
            if n == PEEK_LIMIT {
                return Ok(None);
            }
            seen = n;
        }
        // peek hands back the same bytes until more arrive.
        tokio::time::sleep(PEEK_BACKOFF).await;
    }
}

async fn handle_connection(mut stream: TcpStream, hub: HubStore, ws_path: &str) -> Result<()> {
    let Some(head) = peek_head(&stream, HEAD_TIMEOUT).await? else {
        return write_response(&mut stream, "400 Bad Request", "text/plain", "bad request").await;
    };
    let (path, query) = split_target(&head.target);

    if head.upgrade_websocket && path == ws_path {
        let user = relay::identify(&parse_query(query));
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        relay::handle_ws(ws_stream, hub, user).await;
        return Ok(());
    }

    // Consume the head we peeked before answering.
    let mut buf = vec![0u8; PEEK_LIMIT];
    let _ = stream.read(&mut buf).await?;

    match (head.method.as_str(), path) {
        ("GET", "/health") => {
            let body = json!({
                "status": "ok",
                "collaborators": relay::collaborator_count(&hub),
            });
            write_response(&mut stream, "200 OK", "application/json", &body.to_string()).await
        }
        ("GET", "/roster") => {
            let body = serde_json::to_string(&relay::roster_snapshot(&hub))?;
            write_response(&mut stream, "200 OK", "application/json", &body).await
        }
        _ => write_response(&mut stream, "404 Not Found", "text/plain", "not found").await,
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("Ann+Lee"), "Ann Lee");
        assert_eq!(url_decode("J%C3%BCrgen"), "Jürgen");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query("name=Ann%20Lee&id=u1&&avatar=");
        assert_eq!(q.get("name").map(String::as_str), Some("Ann Lee"));
        assert_eq!(q.get("id").map(String::as_str), Some("u1"));
        assert_eq!(q.get("avatar").map(String::as_str), Some(""));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("/ws?name=a"), ("/ws", "name=a"));
        assert_eq!(split_target("/health"), ("/health", ""));
    }

    #[test]
    fn test_parse_head_detects_upgrade() {
        let raw = b"GET /ws?name=Ann HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n";
        let head = parse_head(raw).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/ws?name=Ann");
        assert!(head.upgrade_websocket);
    }

    #[test]
    fn test_parse_head_plain_get() {
        let head = parse_head(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(!head.upgrade_websocket);
    }

    #[test]
    fn test_parse_head_incomplete() {
        assert!(parse_head(b"GET /health HTTP/1.1\r\nHost: x\r\n").is_none());
        assert!(parse_head(b"\x16\x03\x01garbage").is_none());
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_peek_head_waits_for_a_slow_head() {
        let (mut client, server) = pair().await;
        let writer = tokio::spawn(async move {
            client.write_all(b"GET /hea").await.unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
            client.write_all(b"lth HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
            client
        });
        let head = peek_head(&server, HEAD_TIMEOUT).await.unwrap().unwrap();
        assert_eq!(head.target, "/health");
        let _client = writer.await.unwrap();

        // Still unread: the whole head is there for the handler.
        let mut buf = [0u8; 64];
        let n = server.peek(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"GET /health"));
    }

    #[tokio::test]
    async fn test_peek_head_gives_up_after_limit() {
        let (mut client, server) = pair().await;
        client.write_all(b"GET /health HTTP/1.1\r\n").await.unwrap();
        let head = peek_head(&server, Duration::from_millis(200)).await.unwrap();
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn test_peek_head_sees_peer_close() {
        let (client, server) = pair().await;
        drop(client);
        assert!(peek_head(&server, HEAD_TIMEOUT).await.unwrap().is_none());
    }
}
