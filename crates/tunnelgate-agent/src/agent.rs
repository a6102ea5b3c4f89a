//! Per-client tunnel socket pool and acceptor
//!
//! A [`TunnelAgent`] owns a TCP acceptor on an allocated port that
//! receives reverse connections dialed by one remote client. It behaves
//! like an HTTP transport whose sockets are supplied externally rather
//! than dialed outward: [`TunnelAgent::borrow`] hands out an idle socket
//! or parks the caller as a waiter until one is admitted.

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use tunnelgate_portpool::{PortAllocator, PortAllocatorError};

use crate::connection::TunnelSocket;
use crate::shared::{admit, shutdown, Shared};

/// Lifecycle events an agent broadcasts as its connected-socket count
/// transitions, and when it tears down for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// Connected socket count went from zero to non-zero.
    Online,
    /// Connected socket count dropped to zero.
    Offline,
    /// The agent has closed; no further events will follow.
    End,
}

/// Errors surfaced by a [`TunnelAgent`].
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent already started")]
    AlreadyStarted,

    #[error("agent is closed")]
    AgentClosed,

    #[error("port allocator error: {0}")]
    PortAllocator(#[from] PortAllocatorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot of an agent's pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStats {
    pub connected_sockets: u32,
}

/// Default cap on simultaneously connected reverse sockets per client.
pub const DEFAULT_MAX_TCP_SOCKETS: u32 = 10;

/// Per-client pool of reverse tunnel sockets plus their acceptor.
#[derive(Clone)]
pub struct TunnelAgent {
    shared: Arc<Shared>,
}

impl TunnelAgent {
    /// Create a new, unstarted agent for `client_id`. Call [`listen`](Self::listen)
    /// to bind its acceptor before borrowing sockets.
    pub fn new(
        client_id: impl Into<String>,
        max_tcp_sockets: u32,
        port_allocator: Option<Arc<PortAllocator>>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared::new(
                client_id.into(),
                max_tcp_sockets,
                port_allocator,
                events,
            )),
        }
    }

    /// Subscribe to this agent's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.shared.events.subscribe()
    }

    /// Bind the reverse-connection acceptor and start accepting sockets.
    ///
    /// Acquires a port from the configured [`PortAllocator`] if one was
    /// supplied and has a range; otherwise binds an OS-assigned ephemeral
    /// port. Returns the bound port either way.
    pub async fn listen(&self) -> Result<u16, AgentError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.started {
                return Err(AgentError::AlreadyStarted);
            }
            state.started = true;
        }

        let requested_port = match &self.shared.port_allocator {
            Some(alloc) => alloc.acquire(&self.shared.client_id)?,
            None => None,
        };

        let listener = TcpListener::bind(("0.0.0.0", requested_port.unwrap_or(0))).await?;
        let bound_port = listener.local_addr()?.port();

        {
            let mut state = self.shared.state.lock().unwrap();
            state.listen_port = Some(bound_port);
        }

        debug!(
            client_id = %self.shared.client_id,
            port = bound_port,
            "tunnel agent listening for reverse connections"
        );

        let shared = self.shared.clone();
        let task = tokio::spawn(accept_loop(shared.clone(), listener));
        self.shared.state.lock().unwrap().accept_task = Some(task);

        Ok(bound_port)
    }

    /// Borrow an idle tunnel socket, parking until one is admitted if
    /// none is currently idle.
    pub async fn borrow(&self) -> Result<TunnelSocket, AgentError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(AgentError::AgentClosed);
        }
        if let Some(idle) = state.available.pop_front() {
            drop(state);
            let _ = idle.cancel_watch.send(());
            return Ok(TunnelSocket::new(idle.id, idle.stream, self.shared.clone()));
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        drop(state);

        rx.await.map_err(|_| AgentError::AgentClosed)
    }

    /// Close the acceptor, drain waiters with `AgentClosed`, and emit `end`.
    pub fn destroy(&self) {
        shutdown(&self.shared);
    }

    /// Current pool occupancy.
    pub fn stats(&self) -> AgentStats {
        AgentStats {
            connected_sockets: self.shared.state.lock().unwrap().connected,
        }
    }

    /// The port the acceptor is bound to, once [`listen`](Self::listen) has
    /// completed.
    pub fn listen_port(&self) -> Option<u16> {
        self.shared.state.lock().unwrap().listen_port
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!(%peer, "reverse connection accepted");
                admit(&shared, stream);
            }
            Err(e) => {
                if is_routine_io_error(&e) {
                    debug!(error = %e, "acceptor error (routine)");
                } else {
                    warn!(error = %e, "acceptor error");
                }
            }
        }
        if shared.state.lock().unwrap().closed {
            break;
        }
    }
}

fn is_routine_io_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionReset | ConnectionAborted | TimedOut | UnexpectedEof | BrokenPipe
    )
}
