//! Per-connection handling: sniff for a protocol-upgrade request before
//! handing a connection to hyper, since hyper's own upgrade machinery would
//! force us to write a response before the raw tunnel takes over — and the
//! backend's actual response (including status line) has to reach the
//! public caller byte for byte.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tower::ServiceExt;
use tracing::{debug, warn};

use tunnelgate_dispatch::{dispatch_request, dispatch_upgrade, RequestDispatch, UpgradeDispatch};
use tunnelgate_registry::ClientRegistry;

use crate::admin::AdminState;

const PEEK_BUF_LEN: usize = 8192;
const MAX_HEAD_PEEK_ATTEMPTS: u32 = 50;

/// Handle one accepted public connection end to end.
pub async fn handle_connection(
    stream: TcpStream,
    registry: ClientRegistry,
    admin: AdminState,
    base_domain: Arc<String>,
) {
    let _ = stream.set_nodelay(true);

    match peek_is_upgrade(&stream).await {
        Ok(true) => handle_upgrade_connection(stream, registry, base_domain).await,
        Ok(false) => handle_plain_connection(stream, registry, admin, base_domain).await,
        Err(e) => debug!(error = %e, "connection closed before request head arrived"),
    }
}

/// Peek at the connection's leading bytes (without consuming them) until
/// the request head is fully buffered or we give up, and report whether it
/// names an `Upgrade:` header.
async fn peek_is_upgrade(stream: &TcpStream) -> std::io::Result<bool> {
    let mut buf = vec![0u8; PEEK_BUF_LEN];
    for _ in 0..MAX_HEAD_PEEK_ATTEMPTS {
        stream.readable().await?;
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        let head_complete = buf[..n].windows(4).any(|w| w == b"\r\n\r\n");
        if contains_upgrade_header(&buf[..n]) {
            return Ok(true);
        }
        if head_complete {
            return Ok(false);
        }
        if n == buf.len() {
            buf.resize(buf.len() * 2, 0);
        }
    }
    Ok(false)
}

fn contains_upgrade_header(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    text.lines()
        .take_while(|line| !line.is_empty())
        .any(|line| {
            line.split_once(':')
                .map(|(name, _)| name.trim().eq_ignore_ascii_case("upgrade"))
                .unwrap_or(false)
        })
}

async fn handle_plain_connection(
    stream: TcpStream,
    registry: ClientRegistry,
    admin: AdminState,
    base_domain: Arc<String>,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
        let registry = registry.clone();
        let admin = admin.clone();
        let base_domain = base_domain.clone();
        async move { handle_request(req, registry, admin, base_domain).await }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        debug!(error = %e, "connection ended with an error");
    }
}

async fn handle_request(
    req: hyper::Request<hyper::body::Incoming>,
    registry: ClientRegistry,
    admin: AdminState,
    base_domain: Arc<String>,
) -> Result<hyper::Response<axum::body::Body>, Infallible> {
    let req = req.map(axum::body::Body::new);
    match dispatch_request(&registry, &base_domain, req).await {
        RequestDispatch::Response(resp) => Ok(resp.map(axum::body::Body::new)),
        RequestDispatch::Fallthrough(req) => {
            let router = crate::admin::router(admin);
            match router.oneshot(req).await {
                Ok(resp) => Ok(resp),
                Err(infallible) => match infallible {},
            }
        }
    }
}

/// Manually parse the request head off a peeked-but-unconsumed socket and
/// splice it with the tunnel session directly, bypassing hyper entirely so
/// the backend's raw response bytes flow through untouched.
async fn handle_upgrade_connection(
    stream: TcpStream,
    registry: ClientRegistry,
    base_domain: Arc<String>,
) {
    let mut reader = BufReader::new(stream);
    let (parts, raw_head) = match read_request_head(&mut reader).await {
        Ok(Some(pair)) => pair,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "failed to parse upgrade request head");
            let _ = reader.shutdown().await;
            return;
        }
    };

    match dispatch_upgrade(&registry, &base_domain, &parts, raw_head, reader).await {
        UpgradeDispatch::Handled => {}
        UpgradeDispatch::Fallthrough => {
            // The admin/bootstrap layer doesn't speak any upgrade protocol;
            // there's nothing sensible to splice to.
            debug!("upgrade request had no subdomain; closing");
        }
    }
}

/// Parse a bare HTTP/1.1 request line and headers off `reader`, leaving any
/// bytes already buffered past the blank line untouched for later use as
/// part of the spliced stream.
///
/// Returns both a parsed [`Parts`] (used only for routing: method/URI/Host
/// lookup) and the exact raw bytes of the request line and headers as they
/// arrived on the wire, blank line included — the latter is what actually
/// gets forwarded onto the tunnel socket, so header casing and the ordering
/// of repeated header names survive untouched, which `Parts`'s `HeaderMap`
/// cannot preserve.
async fn read_request_head<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<(Parts, Bytes)>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut raw = Vec::new();

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    raw.extend_from_slice(request_line.as_bytes());

    let mut segments = request_line.trim_end().splitn(3, ' ');
    let method = segments.next().unwrap_or("");
    let uri = segments.next().unwrap_or("/");

    let mut builder = http::Request::builder()
        .method(method)
        .uri(uri)
        .version(http::Version::HTTP_11);

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        raw.extend_from_slice(line.as_bytes());
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            builder = builder.header(name.trim(), value.trim());
        }
    }

    let request = builder
        .body(())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some((request.into_parts().0, Bytes::from(raw))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_an_upgrade_header_case_insensitively() {
        let head = b"GET /chat HTTP/1.1\r\nHost: foo.tunnel.dev\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(contains_upgrade_header(head));
    }

    #[test]
    fn plain_requests_have_no_upgrade_header() {
        let head = b"GET / HTTP/1.1\r\nHost: foo.tunnel.dev\r\nAccept: */*\r\n\r\n";
        assert!(!contains_upgrade_header(head));
    }

    #[test]
    fn only_looks_at_header_lines_not_the_request_line_or_body() {
        let head = b"GET /upgrade-path HTTP/1.1\r\nHost: foo.tunnel.dev\r\n\r\nUpgrade: ignored-in-body\r\n";
        assert!(!contains_upgrade_header(head));
    }

    #[tokio::test]
    async fn read_request_head_parses_method_uri_and_headers() {
        let raw = b"GET /widgets?x=1 HTTP/1.1\r\nHost: foo.tunnel.dev\r\nUpgrade: websocket\r\n\r\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(raw));
        let (parts, _raw_head) = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(parts.method, http::Method::GET);
        assert_eq!(parts.uri.path(), "/widgets");
        assert_eq!(parts.uri.query(), Some("x=1"));
        assert_eq!(parts.headers.get("host").unwrap(), "foo.tunnel.dev");
        assert_eq!(parts.headers.get("upgrade").unwrap(), "websocket");
    }

    #[tokio::test]
    async fn read_request_head_preserves_raw_header_casing_and_order_verbatim() {
        let raw =
            b"GET /chat HTTP/1.1\r\nHOST: foo.tunnel.dev\r\nSec-WebSocket-Key: xyz\r\nUpgrade: websocket\r\n\r\n"
                .to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(raw.clone()));
        let (_parts, raw_head) = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(&raw_head[..], &raw[..]);
    }

    #[tokio::test]
    async fn read_request_head_returns_none_on_immediate_eof() {
        let mut reader = BufReader::new(std::io::Cursor::new(Vec::new()));
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }
}
