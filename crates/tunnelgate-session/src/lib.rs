//! One subdomain's tunnel session: a [`TunnelAgent`], its grace timer, and
//! the translation of public HTTP traffic onto borrowed tunnel sockets.

mod grace;
mod proxy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use hyper::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace};

use tunnelgate_agent::{AgentEvent, TunnelAgent};

pub use proxy::ResponseBody;

/// How long a session may go without an established tunnel socket (either
/// right after creation, or after its last one drops) before it is reaped.
pub const GRACE_PERIOD: Duration = Duration::from_millis(1000);

struct Inner {
    id: String,
    secret: Option<String>,
    agent: TunnelAgent,
    grace: Arc<grace::GraceTimer>,
    closed: AtomicBool,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Owns one [`TunnelAgent`] for the lifetime of one subdomain's session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

impl ClientSession {
    /// Build a session around an already-constructed (but not yet
    /// listening) agent. Returns the session plus a receiver that fires
    /// once, when the session closes itself (grace timeout or the
    /// agent's `end` event) — callers (the registry) use it to evict
    /// their own entry.
    pub fn new(
        id: impl Into<String>,
        secret: Option<String>,
        agent: TunnelAgent,
    ) -> (Self, oneshot::Receiver<()>) {
        let (close_tx, close_rx) = oneshot::channel();
        let inner = Arc::new(Inner {
            id: id.into(),
            secret,
            agent,
            grace: Arc::new(grace::GraceTimer::new()),
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
        });

        let events = inner.agent.subscribe();
        tokio::spawn(supervise(inner.clone(), events));
        arm_grace(&inner);

        (Self { inner }, close_rx)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.inner.agent.listen_port()
    }

    pub fn agent(&self) -> &TunnelAgent {
        &self.inner.agent
    }

    pub fn stats(&self) -> tunnelgate_agent::AgentStats {
        self.inner.agent.stats()
    }

    /// Weak "same logical identity" check against the session's stored
    /// secret; not a real authentication boundary (see `tunnelgate_auth`).
    pub fn is_authorized(&self, bearer_token: &str) -> bool {
        tunnelgate_auth::same_identity(self.inner.secret.as_deref(), bearer_token)
    }

    /// Borrow a tunnel socket, forward `req` over an HTTP/1.1 handshake,
    /// and return the (streamed) response.
    pub async fn proxy_http_request<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        proxy::proxy_http_request(&self.inner.agent, req).await
    }

    /// Borrow a tunnel socket and splice it with `public_socket` for a
    /// protocol upgrade (e.g. WebSocket). `raw_head` is the exact bytes of
    /// the request line and headers that triggered the upgrade, verbatim
    /// off the wire, and is written to the tunnel socket unchanged so
    /// header casing and ordering survive.
    pub async fn proxy_http_upgrade<S>(&self, raw_head: Bytes, public_socket: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        proxy::proxy_http_upgrade(&self.inner.agent, &raw_head, public_socket).await
    }

    /// Cancel the grace timer, destroy the agent, and fire the close
    /// signal exactly once. Safe to call more than once.
    pub fn close(&self) {
        trigger_close(&self.inner);
    }
}

fn arm_grace(inner: &Arc<Inner>) {
    let inner_for_expiry = inner.clone();
    inner.grace.rearm(GRACE_PERIOD, move || {
        debug!(id = %inner_for_expiry.id, "grace timer expired, closing session");
        trigger_close(&inner_for_expiry);
    });
}

fn trigger_close(inner: &Arc<Inner>) {
    if inner.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    inner.grace.cancel();
    inner.agent.destroy();
    if let Some(tx) = inner.close_tx.lock().unwrap().take() {
        let _ = tx.send(());
    }
}

async fn supervise(inner: Arc<Inner>, mut events: broadcast::Receiver<AgentEvent>) {
    loop {
        match events.recv().await {
            Ok(AgentEvent::Online) => {
                trace!(id = %inner.id, "online, cancelling grace timer");
                inner.grace.cancel();
            }
            Ok(AgentEvent::Offline) => {
                trace!(id = %inner.id, "offline, re-arming grace timer");
                arm_grace(&inner);
            }
            Ok(AgentEvent::End) => {
                // A normal close always goes through `ClientSession::close`
                // first (which already destroys the agent), so an `end`
                // reaching us here means the agent tore itself down on its
                // own - treat it as the fatal-error case.
                trigger_close(&inner);
                break;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
