//! Per-client reverse-tunnel socket pool.
//!
//! This crate owns the acceptor side of the tunnel: a [`TunnelAgent`]
//! binds a port, receives reverse TCP connections dialed in by one
//! remote client, and hands them out to callers (a [`ClientSession`] in
//! `tunnelgate-session`) via [`TunnelAgent::borrow`]. It has no notion of
//! HTTP; it is purely connection plumbing.

mod agent;
mod connection;
mod shared;

pub use agent::{AgentError, AgentEvent, AgentStats, TunnelAgent, DEFAULT_MAX_TCP_SOCKETS};
pub use connection::{TunnelSocket, TunnelSocketIo};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tunnelgate_portpool::PortAllocator;

    async fn connect_to(port: u16) -> TcpStream {
        TcpStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    #[tokio::test]
    async fn listen_binds_a_port_and_rejects_double_start() {
        let agent = TunnelAgent::new("client-a", DEFAULT_MAX_TCP_SOCKETS, None);
        let port = agent.listen().await.unwrap();
        assert_eq!(agent.listen_port(), Some(port));

        let err = agent.listen().await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyStarted));
        agent.destroy();
    }

    #[tokio::test]
    async fn borrow_waits_for_a_reverse_connection_then_returns_it() {
        let agent = TunnelAgent::new("client-b", DEFAULT_MAX_TCP_SOCKETS, None);
        let port = agent.listen().await.unwrap();

        let borrow_task = tokio::spawn({
            let agent = agent.clone();
            async move { agent.borrow().await.unwrap() }
        });

        // Give the borrow() call time to park as a waiter first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _client_side = connect_to(port).await;

        let socket = tokio::time::timeout(Duration::from_secs(1), borrow_task)
            .await
            .unwrap()
            .unwrap();
        assert!(socket.peer_addr().is_ok());
        agent.destroy();
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let agent = Arc::new(TunnelAgent::new("client-c", DEFAULT_MAX_TCP_SOCKETS, None));
        let port = agent.listen().await.unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3u32 {
            let agent = agent.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                agent.borrow().await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Stagger so the waiters enqueue in a known sequence.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for _ in 0..3 {
            let _c = connect_to(port).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for h in handles {
            tokio::time::timeout(Duration::from_secs(1), h)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn overflow_connections_beyond_the_cap_are_dropped() {
        let agent = TunnelAgent::new("client-d", 1, None);
        let port = agent.listen().await.unwrap();

        let _first = connect_to(port).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(agent.stats().connected_sockets, 1);

        let mut second = connect_to(port).await;
        // The agent should have closed this one immediately (overflow).
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_millis(200), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(agent.stats().connected_sockets, 1);
        agent.destroy();
    }

    #[tokio::test]
    async fn idle_socket_closed_remotely_is_detected_and_decrements_count() {
        let agent = TunnelAgent::new("client-e", DEFAULT_MAX_TCP_SOCKETS, None);
        let port = agent.listen().await.unwrap();

        let client_side = connect_to(port).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(agent.stats().connected_sockets, 1);

        drop(client_side);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.stats().connected_sockets, 0);
        agent.destroy();
    }

    #[tokio::test]
    async fn finish_with_keep_alive_recaches_exactly_one_idle_socket() {
        let agent = TunnelAgent::new("client-f", DEFAULT_MAX_TCP_SOCKETS, None);
        let port = agent.listen().await.unwrap();

        let _c1 = connect_to(port).await;
        let socket = agent.borrow().await.unwrap();
        socket.finish(true);

        // Still connected (recached), not decremented.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(agent.stats().connected_sockets, 1);

        let socket2 = agent.borrow().await.unwrap();
        socket2.finish(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(agent.stats().connected_sockets, 0);
        agent.destroy();
    }

    #[tokio::test]
    async fn keep_alive_hand_back_goes_straight_to_a_parked_waiter() {
        let agent = Arc::new(TunnelAgent::new("client-j", DEFAULT_MAX_TCP_SOCKETS, None));
        let port = agent.listen().await.unwrap();

        let _c1 = connect_to(port).await;
        let socket_a = agent.borrow().await.unwrap();

        // B parks as a waiter: nothing is available, the only connected
        // socket is already borrowed by A.
        let waiter = tokio::spawn({
            let agent = agent.clone();
            async move { agent.borrow().await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A offers its socket back as the keep-alive slot. It must reach
        // the parked waiter directly instead of sitting in `available`
        // while B keeps waiting for a brand new reverse connection.
        socket_a.finish(true);

        let socket_b = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("hand-back must satisfy the parked waiter without a new connection")
            .unwrap();
        assert_eq!(agent.stats().connected_sockets, 1);
        socket_b.finish(false);
        agent.destroy();
    }

    #[tokio::test]
    async fn destroy_fails_pending_waiters_and_future_borrows() {
        let agent = Arc::new(TunnelAgent::new("client-g", DEFAULT_MAX_TCP_SOCKETS, None));
        agent.listen().await.unwrap();

        let waiter = tokio::spawn({
            let agent = agent.clone();
            async move { agent.borrow().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        agent.destroy();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AgentError::AgentClosed)));

        let err = agent.borrow().await.unwrap_err();
        assert!(matches!(err, AgentError::AgentClosed));
    }

    #[tokio::test]
    async fn destroy_releases_its_allocated_port() {
        let alloc = Arc::new(PortAllocator::new(Some("18000:18001")).unwrap());
        let agent = TunnelAgent::new("client-h", DEFAULT_MAX_TCP_SOCKETS, Some(alloc.clone()));
        let port = agent.listen().await.unwrap();
        assert!(alloc.acquire("someone-else").is_err() || port != 0);

        agent.destroy();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Port should be free again now.
        let reacquired = alloc.acquire("client-h-again").unwrap();
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn events_report_online_and_offline_transitions() {
        let agent = TunnelAgent::new("client-i", DEFAULT_MAX_TCP_SOCKETS, None);
        let mut events = agent.subscribe();
        let port = agent.listen().await.unwrap();

        let client_side = connect_to(port).await;
        let ev = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev, AgentEvent::Online);

        drop(client_side);
        let ev = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev, AgentEvent::Offline);

        agent.destroy();
        let ev = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev, AgentEvent::End);
    }
}
