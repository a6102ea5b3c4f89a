//! Translate public HTTP traffic into traffic on borrowed tunnel sockets.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use tunnelgate_agent::TunnelAgent;

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

fn text_body(text: &'static str) -> ResponseBody {
    Full::new(Bytes::from_static(text.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

/// Synthesize a response for failures that occur before any response
/// headers have reached the public caller.
fn bad_gateway(reason: &str) -> Response<ResponseBody> {
    warn!(reason, "proxy_http_request failed before response headers were sent");
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(text_body("Bad Gateway"))
        .expect("static bad gateway response is well-formed")
}

/// Borrow a tunnel socket, run an HTTP/1.1 exchange over it, and stream
/// the response back. On borrow/handshake/send failure, synthesizes a
/// 502 since no response headers have gone out yet.
pub async fn proxy_http_request<B>(agent: &TunnelAgent, req: Request<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let socket = match agent.borrow().await {
        Ok(socket) => socket,
        Err(e) => return bad_gateway(&format!("borrow failed: {e}")),
    };

    let io = TokioIo::new(socket.io_handle());
    let (mut sender, conn) = match http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            socket.finish(false);
            return bad_gateway(&format!("handshake failed: {e}"));
        }
    };

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "tunnel HTTP/1.1 connection driver ended");
        }
    });

    let response = match sender.send_request(req).await {
        Ok(response) => response,
        Err(e) => {
            socket.finish(false);
            return bad_gateway(&format!("send_request failed: {e}"));
        }
    };

    // Mirror the corpus's pooled-connection pattern: only offer the
    // socket back as the cached idle slot if hyper still thinks the
    // connection is healthy.
    socket.finish(sender.is_ready());

    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.boxed())
}

/// Borrow a tunnel socket and splice it bidirectionally with `public_socket`
/// after writing `raw_head` onto it verbatim, for a (typically WebSocket)
/// protocol upgrade.
///
/// `raw_head` is forwarded byte-for-byte rather than reconstructed from a
/// parsed header map, so the original casing and ordering of the request
/// line and headers survive unchanged onto the tunnel socket.
pub async fn proxy_http_upgrade<S>(agent: &TunnelAgent, raw_head: &[u8], mut public_socket: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut socket = match agent.borrow().await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(error = %e, "upgrade borrow failed, ending public socket");
            let _ = public_socket.shutdown().await;
            return;
        }
    };

    if let Err(e) = socket.write_all(raw_head).await {
        debug!(error = %e, "failed writing upgrade request onto tunnel socket");
        socket.finish(false);
        let _ = public_socket.shutdown().await;
        return;
    }

    match tokio::io::copy_bidirectional(&mut public_socket, &mut socket).await {
        Ok((to_tunnel, to_public)) => {
            debug!(to_tunnel, to_public, "upgrade stream closed");
        }
        Err(e) => {
            debug!(error = %e, "upgrade stream ended with an io error");
        }
    }
    socket.finish(false);
}
