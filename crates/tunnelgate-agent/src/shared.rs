//! Internal pool state shared between the acceptor task, borrowers, and
//! idle-socket watchers. Kept behind a single `Mutex` since every field
//! changes together under the admission/borrow protocol.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tunnelgate_portpool::PortAllocator;

use crate::connection::TunnelSocket;
use crate::AgentEvent;

pub(crate) struct IdleSocket {
    pub(crate) id: u64,
    pub(crate) stream: Arc<TcpStream>,
    pub(crate) cancel_watch: oneshot::Sender<()>,
}

pub(crate) struct State {
    pub(crate) connected: u32,
    pub(crate) available: VecDeque<IdleSocket>,
    pub(crate) waiters: VecDeque<oneshot::Sender<TunnelSocket>>,
    pub(crate) listen_port: Option<u16>,
    pub(crate) started: bool,
    pub(crate) closed: bool,
    pub(crate) accept_task: Option<JoinHandle<()>>,
}

pub struct Shared {
    pub(crate) client_id: String,
    pub(crate) max_tcp_sockets: u32,
    pub(crate) port_allocator: Option<Arc<PortAllocator>>,
    pub(crate) events: broadcast::Sender<AgentEvent>,
    pub(crate) state: Mutex<State>,
    next_socket_id: AtomicU64,
}

impl Shared {
    pub(crate) fn new(
        client_id: String,
        max_tcp_sockets: u32,
        port_allocator: Option<Arc<PortAllocator>>,
        events: broadcast::Sender<AgentEvent>,
    ) -> Self {
        Self {
            client_id,
            max_tcp_sockets,
            port_allocator,
            events,
            state: Mutex::new(State {
                connected: 0,
                available: VecDeque::new(),
                waiters: VecDeque::new(),
                listen_port: None,
                started: false,
                closed: false,
                accept_task: None,
            }),
            next_socket_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Admit a freshly-accepted reverse connection into the pool.
///
/// Applies the overflow cap, hands the socket straight to the oldest
/// waiter (scheduled on the next turn, never re-entrantly) or parks it in
/// `available`, and emits `online` on a 0 -> non-zero transition.
pub(crate) fn admit(shared: &Arc<Shared>, stream: TcpStream) {
    let mut state = shared.state.lock().unwrap();
    if state.closed {
        return;
    }
    if state.connected >= shared.max_tcp_sockets {
        debug!(
            client_id = %shared.client_id,
            "tunnel socket overflow, dropping new reverse connection"
        );
        return; // stream dropped here, closing it
    }

    let was_zero = state.connected == 0;
    state.connected += 1;
    let id = shared.next_id();
    let stream = Arc::new(stream);

    if was_zero {
        let _ = shared.events.send(AgentEvent::Online);
    }

    if let Some(waiter) = state.waiters.pop_front() {
        drop(state);
        let socket = TunnelSocket::new(id, stream, shared.clone());
        // Never satisfy a waiter synchronously from the admission path.
        tokio::spawn(async move {
            let _ = waiter.send(socket);
        });
    } else {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        state.available.push_back(IdleSocket {
            id,
            stream: stream.clone(),
            cancel_watch: cancel_tx,
        });
        drop(state);
        spawn_idle_watcher(shared.clone(), id, stream, cancel_rx);
    }
}

/// Called when a borrower is done with a socket (via `TunnelSocket::finish`
/// or its `Drop`). `stream` is `Some` when the caller is offering the
/// connection back as the single cached idle slot.
pub(crate) fn hand_back(shared: &Arc<Shared>, id: u64, stream: Option<Arc<TcpStream>>) {
    let mut state = shared.state.lock().unwrap();
    if state.closed {
        return;
    }

    if let Some(stream) = stream {
        // Mirror `admit`: a waiter parked precisely because nothing was
        // available, so a socket coming back must reach it before it's
        // ever considered for the idle cache (never both non-empty).
        if let Some(waiter) = state.waiters.pop_front() {
            drop(state);
            let socket = TunnelSocket::new(id, stream, shared.clone());
            tokio::spawn(async move {
                let _ = waiter.send(socket);
            });
            return;
        }

        if state.available.is_empty() {
            let (cancel_tx, cancel_rx) = oneshot::channel();
            state.available.push_back(IdleSocket {
                id,
                stream: stream.clone(),
                cancel_watch: cancel_tx,
            });
            drop(state);
            spawn_idle_watcher(shared.clone(), id, stream, cancel_rx);
            return;
        }
    }

    state.connected -= 1;
    let now_zero = state.connected == 0;
    drop(state);
    if now_zero {
        let _ = shared.events.send(AgentEvent::Offline);
    }
}

/// Called by an idle-socket watcher when it observes the remote side
/// close (or misbehave) while the socket was sitting unborrowed.
fn handle_idle_closed(shared: &Arc<Shared>, id: u64) {
    let mut state = shared.state.lock().unwrap();
    let had_it = state
        .available
        .iter()
        .position(|s| s.id == id)
        .map(|pos| {
            state.available.remove(pos);
        })
        .is_some();
    if !had_it || state.closed {
        // Already plucked by a concurrent borrow(), or the agent already
        // tore itself down; whoever got there first owns the bookkeeping.
        return;
    }
    state.connected -= 1;
    let now_zero = state.connected == 0;
    drop(state);
    if now_zero {
        let _ = shared.events.send(AgentEvent::Offline);
    }
}

/// Watch an idle socket for the remote side closing it. Uses a zero-copy
/// readiness probe (`try_read` into a 1-byte buffer) rather than consuming
/// bytes meant for a future borrower.
fn spawn_idle_watcher(
    shared: Arc<Shared>,
    id: u64,
    stream: Arc<TcpStream>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => return,
                ready = stream.readable() => {
                    if ready.is_err() {
                        break;
                    }
                    let mut probe = [0u8; 1];
                    match stream.try_read(&mut probe) {
                        Ok(0) => break,
                        Ok(_) => {
                            warn!(id, "idle tunnel socket sent unexpected data, closing");
                            break;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(_) => break,
                    }
                }
            }
        }
        handle_idle_closed(&shared, id);
    });
}

pub(crate) fn shutdown(shared: &Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();
    if state.closed {
        return;
    }
    state.closed = true;
    let had_connections = state.connected > 0;
    state.connected = 0;
    let waiters = std::mem::take(&mut state.waiters);
    let available = std::mem::take(&mut state.available);
    let listen_port = state.listen_port.take();
    let accept_task = state.accept_task.take();
    drop(state);

    if let Some(task) = accept_task {
        task.abort();
    }
    if let (Some(alloc), Some(port)) = (&shared.port_allocator, listen_port) {
        alloc.release(port);
    }
    // Dropping each waiter's Sender without calling `send` fails its
    // receiver with `RecvError`, which `TunnelAgent::borrow` maps to
    // `AgentClosed`.
    drop(waiters);
    // Idle sockets' cancel senders are dropped along with them, stopping
    // their watchers; the `Arc<TcpStream>` closes once the last ref drops.
    drop(available);

    if had_connections {
        let _ = shared.events.send(AgentEvent::Offline);
    }
    let _ = shared.events.send(AgentEvent::End);
}
