//! Public-facing reverse-tunnel HTTP server: binds the public listener,
//! builds the shared port pool and client registry, and dispatches every
//! accepted connection either onto a tunnel session or the admin router.

mod admin;
mod connection;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use tunnelgate_config::Config;
use tunnelgate_portpool::PortAllocator;
use tunnelgate_registry::ClientRegistry;

pub use admin::AdminState;

/// Bind the public listener and serve connections until the process is
/// asked to shut down.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let port_allocator = Arc::new(PortAllocator::new(config.range.as_deref())?);
    let registry = ClientRegistry::new(
        port_allocator,
        config.max_tcp_sockets,
        config.secret.clone(),
    );
    let config = Arc::new(config);
    let base_domain = Arc::new(config.domain.clone());
    let admin_state = AdminState {
        registry: registry.clone(),
        config: config.clone(),
    };

    let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
    info!(
        address = %config.address,
        port = config.port,
        domain = %config.domain,
        "tunnel server listening"
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to accept a connection");
                continue;
            }
        };
        debug!(%peer, "accepted connection");

        let registry = registry.clone();
        let admin_state = admin_state.clone();
        let base_domain = base_domain.clone();
        tokio::spawn(async move {
            connection::handle_connection(stream, registry, admin_state, base_domain).await;
        });
    }
}
