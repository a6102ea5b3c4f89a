//! Borrowed tunnel socket handle
//!
//! A [`TunnelSocket`] wraps one reverse TCP connection handed out of a
//! [`crate::TunnelAgent`]'s pool. It implements [`AsyncRead`]/[`AsyncWrite`]
//! by delegating to `&TcpStream` (which tokio implements directly, without
//! needing `&mut` access), so a borrowed socket can be used as the
//! transport for an HTTP/1.1 client connection or spliced bidirectionally
//! for a protocol upgrade.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::shared::{hand_back, Shared};

/// A tunnel socket borrowed from an agent's pool.
///
/// Call [`TunnelSocket::finish`] when done to tell the agent whether the
/// connection may be cached as the single idle keep-alive slot. Dropping
/// without calling `finish` is equivalent to `finish(false)`.
pub struct TunnelSocket {
    id: u64,
    stream: Arc<TcpStream>,
    shared: Arc<Shared>,
    resolved: bool,
}

impl TunnelSocket {
    pub(crate) fn new(id: u64, stream: Arc<TcpStream>, shared: Arc<Shared>) -> Self {
        Self {
            id,
            stream,
            shared,
            resolved: false,
        }
    }

    /// Peer address of the underlying reverse connection, for logging.
    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    /// A cheap, clonable `AsyncRead + AsyncWrite` handle onto the same
    /// underlying socket, independent of this `TunnelSocket`'s own
    /// finish/drop bookkeeping.
    ///
    /// Used to hand the socket to an HTTP/1.1 client connection driver
    /// (which takes ownership of its IO type) while the caller still
    /// holds the original `TunnelSocket` to decide, once the exchange is
    /// done, whether to offer it back via [`TunnelSocket::finish`].
    pub fn io_handle(&self) -> TunnelSocketIo {
        TunnelSocketIo(self.stream.clone())
    }

    /// Tell the agent this socket is done being used.
    ///
    /// `keep_alive = true` offers the socket back as the agent's single
    /// cached idle connection; the agent only accepts the offer if it
    /// isn't already holding one. Otherwise (or if declined) the
    /// connection count is decremented and the socket closes.
    pub fn finish(mut self, keep_alive: bool) {
        self.resolved = true;
        let stream = if keep_alive {
            Some(self.stream.clone())
        } else {
            None
        };
        hand_back(&self.shared, self.id, stream);
    }
}

impl Drop for TunnelSocket {
    fn drop(&mut self) {
        if !self.resolved {
            hand_back(&self.shared, self.id, None);
        }
    }
}

impl AsyncRead for TunnelSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut r: &TcpStream = &self.stream;
        Pin::new(&mut r).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut w: &TcpStream = &self.stream;
        Pin::new(&mut w).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut w: &TcpStream = &self.stream;
        Pin::new(&mut w).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut w: &TcpStream = &self.stream;
        Pin::new(&mut w).poll_shutdown(cx)
    }
}

/// See [`TunnelSocket::io_handle`].
#[derive(Clone)]
pub struct TunnelSocketIo(Arc<TcpStream>);

impl AsyncRead for TunnelSocketIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut r: &TcpStream = &self.0;
        Pin::new(&mut r).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelSocketIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut w: &TcpStream = &self.0;
        Pin::new(&mut w).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut w: &TcpStream = &self.0;
        Pin::new(&mut w).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut w: &TcpStream = &self.0;
        Pin::new(&mut w).poll_shutdown(cx)
    }
}
