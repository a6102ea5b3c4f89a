//! HTTP boundary: route by `Host` header to the right tunnel session.

mod host;

pub use host::{extract_host_header, extract_subdomain, normalize_host};

use bytes::Bytes;
use http::request::Parts;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use tunnelgate_registry::ClientRegistry;
use tunnelgate_session::ResponseBody;

fn json_response(status: StatusCode, body: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static json response is well-formed")
}

fn missing_host_response() -> Response<ResponseBody> {
    json_response(StatusCode::BAD_REQUEST, r#"{"message":"Host header required"}"#)
}

fn client_not_found_response() -> Response<ResponseBody> {
    json_response(StatusCode::NOT_FOUND, r#"{"message":"Client not found"}"#)
}

/// Outcome of trying to dispatch a regular (non-upgrade) HTTP request.
pub enum RequestDispatch<B> {
    /// No subdomain in the `Host` header; the request is handed back so the
    /// caller can route it to the admin/landing router.
    Fallthrough(http::Request<B>),
    /// A response to send directly to the public caller.
    Response(Response<ResponseBody>),
}

/// Route `req` by its `Host` header to a tunnel session and proxy it, or
/// hand it back so the caller can fall through to admin/landing routes.
pub async fn dispatch_request<B>(
    registry: &ClientRegistry,
    base_domain: &str,
    req: http::Request<B>,
) -> RequestDispatch<B>
where
    B: hyper::body::Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let Some(host) = extract_host_header(req.headers()).map(str::to_string) else {
        return RequestDispatch::Response(missing_host_response());
    };

    match extract_subdomain(&host, base_domain) {
        None => RequestDispatch::Fallthrough(req),
        Some(subdomain) => match registry.get_client(&subdomain) {
            Some(session) => RequestDispatch::Response(session.proxy_http_request(req).await),
            None => {
                debug!(subdomain, "request for unknown tunnel client");
                RequestDispatch::Response(client_not_found_response())
            }
        },
    }
}

/// Outcome of trying to dispatch a protocol-upgrade request.
pub enum UpgradeDispatch {
    /// No subdomain in the `Host` header; hand off to the admin/landing router.
    Fallthrough,
    /// The upgrade has been fully handled (proxied, or the socket closed).
    Handled,
}

/// Route an upgrade request (e.g. WebSocket) by its `Host` header and
/// splice `public_socket` with the tunnel session, or report fallthrough.
///
/// `parts` is used only for routing (the `Host` header); `raw_head` is the
/// exact bytes of the request line and headers as they arrived on the wire
/// and is what actually gets forwarded onto the tunnel socket, so header
/// casing and the ordering of repeated header names survive untouched.
pub async fn dispatch_upgrade<S>(
    registry: &ClientRegistry,
    base_domain: &str,
    parts: &Parts,
    raw_head: Bytes,
    mut public_socket: S,
) -> UpgradeDispatch
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    let Some(host) = extract_host_header(&parts.headers) else {
        let _ = public_socket.shutdown().await;
        return UpgradeDispatch::Handled;
    };

    match extract_subdomain(host, base_domain) {
        None => UpgradeDispatch::Fallthrough,
        Some(subdomain) => match registry.get_client(&subdomain) {
            Some(session) => {
                session.proxy_http_upgrade(raw_head, public_socket).await;
                UpgradeDispatch::Handled
            }
            None => {
                debug!(subdomain, "upgrade for unknown tunnel client, closing socket");
                let _ = public_socket.shutdown().await;
                UpgradeDispatch::Handled
            }
        },
    }
}
